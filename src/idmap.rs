//! Identity map projection: turning `/etc/subuid`/`/etc/subgid` allocations and a
//! caller's desired mapping into the text written to `/proc/<pid>/uid_map` or
//! `gid_map`.

use std::fs;
use std::path::Path;

use log::debug;

use super::err::{Error, Result};

/// Maximum number of distinct ranges the kernel will accept in a single
/// `uid_map`/`gid_map` write.
pub const MAX_USER_MAPPINGS: usize = 340;

/// Size of the buffer `id_map::emit` formats into before handing it to a
/// single `write()` syscall. Four pages, matching the kernel's own internal
/// limit on map file size.
pub const ID_MAP_MAX: usize = 4 * 4096;

/// One contiguous mapping of `length` ids: `inner`..`inner+length` maps to
/// `outer`..`outer+length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub inner: u32,
    pub outer: u32,
    pub length: u32,
}

impl IdRange {
    pub fn new(inner: u32, outer: u32, length: u32) -> IdRange {
        IdRange {
            inner,
            outer,
            length,
        }
    }

    fn inner_end(&self) -> u64 {
        self.inner as u64 + self.length as u64
    }

    fn outer_end(&self) -> u64 {
        self.outer as u64 + self.length as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortKey {
    Inner,
    Outer,
}

/// An ordered, non-overlapping sequence of id ranges.
#[derive(Debug, Clone, Default)]
pub struct IdMap {
    ranges: Vec<IdRange>,
}

impl IdMap {
    pub fn new() -> IdMap {
        IdMap { ranges: Vec::new() }
    }

    pub fn from_ranges(ranges: Vec<IdRange>) -> IdMap {
        IdMap { ranges }
    }

    pub fn push(&mut self, r: IdRange) -> &mut Self {
        self.ranges.push(r);
        self
    }

    pub fn add(&mut self, inner: u32, outer: u32, length: u32) -> &mut Self {
        self.push(IdRange::new(inner, outer, length))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdRange> {
        self.ranges.iter()
    }

    pub fn total_length(&self) -> u64 {
        self.ranges.iter().map(|r| r.length as u64).sum()
    }

    fn normalized(&self, key: SortKey) -> Result<IdMap> {
        let mut ranges = self.ranges.clone();
        ranges.sort_by_key(|r| match key {
            SortKey::Inner => r.inner,
            SortKey::Outer => r.outer,
        });

        let mut out: Vec<IdRange> = Vec::with_capacity(ranges.len());
        for r in ranges {
            if r.length == 0 {
                continue;
            }
            if let Some(last) = out.last_mut() {
                let contiguous = match key {
                    SortKey::Inner => {
                        last.inner_end() == r.inner as u64 && last.outer_end() == r.outer as u64
                    }
                    SortKey::Outer => {
                        last.outer_end() == r.outer as u64 && last.inner_end() == r.inner as u64
                    }
                };
                if contiguous {
                    last.length += r.length;
                    continue;
                }
                let overlaps = match key {
                    SortKey::Inner => (r.inner as u64) < last.inner_end(),
                    SortKey::Outer => (r.outer as u64) < last.outer_end(),
                };
                if overlaps {
                    return Err(Error::OverlappingRange);
                }
            }
            out.push(r);
        }
        if out.len() > MAX_USER_MAPPINGS {
            return Err(Error::TooManyRanges);
        }
        Ok(IdMap::from_ranges(out))
    }

    /// Sort by `inner`, coalesce contiguous ranges, reject overlaps.
    pub fn normalize(&self) -> Result<IdMap> {
        self.normalized(SortKey::Inner)
    }

    /// Sort by `outer`, coalesce contiguous ranges, reject overlaps. Used for
    /// the subid pool, which is addressed by its outer (host) coordinate.
    pub fn normalize_by_outer(&self) -> Result<IdMap> {
        self.normalized(SortKey::Outer)
    }

    /// For each range `r` of `self`, find the range of `b` whose `inner`
    /// coordinate fully covers `[r.outer, r.outer+r.length)`, and emit
    /// `(r.inner, b.outer + (r.outer - b.inner), r.length)`.
    ///
    /// A range of `self` not fully covered by a single range of `b` is a
    /// hard failure: partial coverage would silently narrow the requested
    /// mapping.
    pub fn project(&self, b: &IdMap) -> Result<IdMap> {
        let b = b.normalize()?;
        let mut out = Vec::with_capacity(self.ranges.len());
        for r in &self.ranges {
            let covering = b.ranges.iter().find(|br| {
                br.inner as u64 <= r.outer as u64 && r.outer_end() <= br.inner_end()
            });
            match covering {
                Some(br) => {
                    let outer = br.outer as u64 + (r.outer as u64 - br.inner as u64);
                    out.push(IdRange::new(r.inner, outer as u32, r.length));
                }
                None => {
                    return Err(Error::UnmappedId {
                        inner: r.inner,
                        outer: r.outer,
                        length: r.length,
                    })
                }
            }
        }
        Ok(IdMap::from_ranges(out))
    }

    /// Format as the kernel expects: one `inner outer length\n` line per range.
    pub fn emit(&self) -> Result<String> {
        let mut s = String::new();
        for r in &self.ranges {
            s += &format!("{} {} {}\n", r.inner, r.outer, r.length);
            if s.len() > ID_MAP_MAX {
                return Err(Error::IdMapOverflow);
            }
        }
        Ok(s)
    }
}

/// One allocation from `/etc/subuid` or `/etc/subgid`: `name_or_id:outer:length`.
fn parse_subid_line(line: &str) -> Option<(String, u32, u32)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line.splitn(3, ':');
    let name = parts.next()?.to_string();
    let outer: u32 = parts.next()?.parse().ok()?;
    let length: u32 = parts.next()?.parse().ok()?;
    Some((name, outer, length))
}

/// Load the sub-id ranges allocated to `user` (matched by name or by decimal
/// uid/gid) from a `/etc/subuid`-or-`/etc/subgid`-shaped file.
///
/// Returned as an identity map (`inner == outer`): the subid pool has no
/// intrinsic inner coordinate of its own until it is assigned one by
/// `generate()` or projected against by `project()`.
pub fn load_subids<P: AsRef<Path>>(path: P, user: &str, id: u32) -> Result<IdMap> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::file("read", path, e))?;
    let mut map = IdMap::new();
    for line in text.lines() {
        if let Some((name, outer, length)) = parse_subid_line(line) {
            if name == user || name.parse::<u32>() == Ok(id) {
                map.add(outer, outer, length);
            }
        }
    }
    debug!("loaded {} subid range(s) for {}", map.ranges.len(), user);
    Ok(map)
}

/// Parse the kernel's own `inner outer length` format, as found in
/// `/proc/self/uid_map` / `/proc/self/gid_map`.
pub fn parse_kernel_map<P: AsRef<Path>>(path: P) -> Result<IdMap> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::file("read", path, e))?;
    let mut map = IdMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut it = line.split_whitespace();
        let inner: u32 = it
            .next()
            .ok_or_else(|| Error::parse("missing inner", path))?
            .parse()
            .map_err(|_| Error::parse("bad inner", path))?;
        let outer: u32 = it
            .next()
            .ok_or_else(|| Error::parse("missing outer", path))?
            .parse()
            .map_err(|_| Error::parse("bad outer", path))?;
        let length: u32 = it
            .next()
            .ok_or_else(|| Error::parse("missing length", path))?
            .parse()
            .map_err(|_| Error::parse("bad length", path))?;
        map.add(inner, outer, length);
    }
    Ok(map)
}

/// Project `desired` through `subids` (per-user allocation) and then through
/// `cur_map` (the invoking process's own map, so the result is stated in
/// terms of the kernel's parent-namespace ids).
pub fn project_desired(desired: &IdMap, subids: &IdMap, cur_map: &IdMap) -> Result<IdMap> {
    let desired = desired.normalize_by_outer()?;
    // Represent the subid pool in outer-space, as `project` expects its
    // second argument addressed by `inner`.
    let pool: IdMap = IdMap::from_ranges(
        subids
            .normalize_by_outer()?
            .iter()
            .map(|r| IdRange::new(r.outer, r.outer, r.length))
            .collect(),
    );
    let projected = desired.project(&pool)?;

    if projected.total_length() != desired.total_length() {
        return Err(Error::IdCountMismatch);
    }

    projected.project(cur_map)
}

/// Synthesize a map (used when the caller supplied no `desired` map): the
/// invoking user's own id at inner position 0, followed by every allocated
/// subid range packed contiguously starting at inner position 1.
pub fn generate(self_id: u32, subids: &IdMap, cur_map: &IdMap) -> Result<IdMap> {
    let subids = subids.normalize_by_outer()?;

    let mut intermediate = IdMap::new();
    intermediate.add(0, self_id, 1);

    let mut next_inner: u64 = 1;
    for r in subids.iter() {
        intermediate.add(next_inner as u32, r.outer, r.length);
        next_inner += r.length as u64;
    }

    intermediate.project(cur_map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(len: u32) -> IdMap {
        let mut m = IdMap::new();
        m.add(0, 0, len);
        m
    }

    #[test]
    fn normalize_coalesces_contiguous() {
        let mut m = IdMap::new();
        m.add(10, 1000, 5);
        m.add(0, 990, 10);
        let n = m.normalize().unwrap();
        assert_eq!(n.iter().count(), 1);
        let r = n.iter().next().unwrap();
        assert_eq!((r.inner, r.outer, r.length), (0, 990, 15));
    }

    #[test]
    fn normalize_rejects_overlap() {
        let mut m = IdMap::new();
        m.add(0, 0, 10);
        m.add(5, 100, 10);
        assert!(m.normalize().is_err());
    }

    #[test]
    fn project_simple() {
        let mut a = IdMap::new();
        a.add(0, 5, 10); // want host ids 5..15
        let mut b = IdMap::new();
        b.add(0, 1000, 100); // host ids 0..100 map to 1000..1100 in some outer space
        let out = a.project(&b).unwrap();
        let r = out.iter().next().unwrap();
        assert_eq!((r.inner, r.outer, r.length), (0, 1005, 10));
    }

    #[test]
    fn project_rejects_uncovered() {
        let mut a = IdMap::new();
        a.add(0, 500, 10);
        let mut b = IdMap::new();
        b.add(0, 1000, 100);
        assert!(a.project(&b).is_err());
    }

    // Scenario 1: identity map with no desired mapping, one subid range.
    #[test]
    fn generate_scenario_identity() {
        let cur = identity(u32::MAX);
        let mut subids = IdMap::new();
        subids.add(100000, 100000, 65536);

        let out = generate(1000, &subids, &cur).unwrap();
        assert_eq!(out.emit().unwrap(), "0 1000 1\n1 100000 65536\n");
    }

    // Scenario 2 (invariant form): a desired map fully covered by the
    // allocated range projects with preserved total length and outer ids
    // inside the allocated window.
    #[test]
    fn project_desired_subset_preserves_invariants() {
        let cur = identity(u32::MAX);
        let mut subids = IdMap::new();
        subids.add(100000, 100000, 65536);

        let mut desired = IdMap::new();
        desired.add(0, 100000, 10);

        let out = project_desired(&desired, &subids, &cur).unwrap();
        assert_eq!(out.total_length(), desired.total_length());
        for r in out.iter() {
            assert!(r.outer >= 100000 && (r.outer as u64 + r.length as u64) <= 165536);
        }
    }

    #[test]
    fn project_desired_rejects_unmapped() {
        let cur = identity(u32::MAX);
        let mut subids = IdMap::new();
        subids.add(100000, 100000, 65536);

        let mut desired = IdMap::new();
        desired.add(0, 5, 10); // outside any allocated range

        assert!(project_desired(&desired, &subids, &cur).is_err());
    }

    #[test]
    fn emit_format() {
        let mut m = IdMap::new();
        m.add(0, 1, 2);
        m.add(15, 16, 2);
        assert_eq!(m.emit().unwrap(), "0 1 2\n15 16 2\n");
    }

    #[test]
    fn parse_subid_line_matches_by_name_or_id() {
        assert_eq!(
            parse_subid_line("alice:100000:65536"),
            Some(("alice".to_string(), 100000, 65536))
        );
        assert_eq!(parse_subid_line("# comment"), None);
        assert_eq!(parse_subid_line(""), None);
    }
}
