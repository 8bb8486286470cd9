use proptest::prelude::*;
use v86_cpu::CpuState;
use v86_task::{Task, TaskFlags, WireError, HEADER_LEN};

fn arb_task() -> impl Strategy<Value = Task> {
    (
        0u32..0x20,
        any::<[u32; 10]>(),
        any::<[u16; 6]>(),
        proptest::collection::vec(any::<u8>(), 0..2048),
    )
        .prop_map(|(bits, d, w, buf)| {
            let regs = CpuState {
                eax: d[0],
                ebx: d[1],
                ecx: d[2],
                edx: d[3],
                esi: d[4],
                edi: d[5],
                ebp: d[6],
                esp: d[7],
                eip: d[8],
                eflags: d[9],
                cs: w[0],
                ds: w[1],
                es: w[2],
                fs: w[3],
                gs: w[4],
                ss: w[5],
            };
            Task::new(TaskFlags::from_bits_truncate(bits), regs, buf)
        })
}

proptest! {
    #[test]
    fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = Task::decode(&bytes);
    }

    #[test]
    fn every_strict_prefix_is_truncated(task in arb_task(), cut in any::<prop::sample::Index>()) {
        let bytes = task.encode().unwrap();
        let cut = cut.index(bytes.len());
        let is_truncated = matches!(Task::decode(&bytes[..cut]), Err(WireError::Truncated { .. }));
        prop_assert!(is_truncated);
    }

    #[test]
    fn encoding_is_header_plus_payload(task in arb_task()) {
        let bytes = task.encode().unwrap();
        prop_assert_eq!(bytes.len(), HEADER_LEN + task.buf.len());
        prop_assert_eq!(Task::decode(&bytes).unwrap(), task);
    }
}
