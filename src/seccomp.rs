//! The x86-64 arch-check BPF snippet consumed by an external seccomp filter
//! compiler (not implemented here). At completion of these instructions the
//! accumulator holds the syscall number, on the condition that the process
//! is running under the expected arch/ABI; otherwise the process is killed.

/// Offsets into `struct seccomp_data` (`arch` then `nr`), matching
/// `<linux/seccomp.h>`.
const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;
const SECCOMP_DATA_NR_OFFSET: u32 = 0;

/// `AUDIT_ARCH_X86_64`, from `<linux/audit.h>`.
const AUDIT_ARCH_X86_64: u32 = 0xc000003e;

/// All system call numbers under the x32 ABI have this bit set.
const X32_SYSCALL_BIT: u32 = 0x4000_0000;

const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;

// BPF opcodes, from <linux/filter.h> / <linux/bpf_common.h>.
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_JGE: u16 = 0x30;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

/// Mirrors `struct sock_filter` from `<linux/filter.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const fn stmt(code: u16, k: u32) -> SockFilter {
    SockFilter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> SockFilter {
    SockFilter { code, jt, jf, k }
}

/// `CHECK_ARCH_AND_LOAD_SYSCALL_NR`: reject any process not running as
/// x86-64 non-x32, loading the syscall number into the BPF accumulator for
/// whatever filter program is appended after this snippet.
pub const ARCH_CHECK: [SockFilter; 5] = [
    stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_ARCH_OFFSET),
    jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_X86_64, 0, 2),
    stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_NR_OFFSET),
    jump(BPF_JMP | BPF_JGE | BPF_K, X32_SYSCALL_BIT, 0, 1),
    stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_check_has_five_statements() {
        assert_eq!(ARCH_CHECK.len(), 5);
        assert_eq!(ARCH_CHECK[4].code, BPF_RET | BPF_K);
        assert_eq!(ARCH_CHECK[4].k, SECCOMP_RET_KILL_PROCESS);
    }
}
