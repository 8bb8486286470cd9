use proptest::prelude::*;
use v86_mem::{RealModeAddress, ScratchPool, BLOCK_ALIGN};

#[derive(Debug, Clone)]
enum Op {
    Alloc(u32),
    /// Free the n-th live allocation (modulo the live count).
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..0x3000).prop_map(Op::Alloc),
        any::<usize>().prop_map(Op::Free),
    ]
}

fn assert_tiles(pool: &ScratchPool) {
    let blocks = pool.blocks();
    assert_eq!(blocks.iter().map(|b| b.size).sum::<u32>(), pool.size());
    assert!(blocks.len() <= pool.capacity());
    for pair in blocks.windows(2) {
        assert!(!(pair[0].free && pair[1].free), "adjacent free blocks: {blocks:?}");
    }
    for block in blocks {
        assert!(block.size > 0);
        assert_eq!(block.size % BLOCK_ALIGN, 0);
    }
}

proptest! {
    #[test]
    fn blocks_always_tile_the_pool(ops in proptest::collection::vec(op(), 1..200)) {
        let base = RealModeAddress::new(0x10000).unwrap();
        let mut pool = ScratchPool::new(base, 0x20000, 32);
        let mut live: Vec<(RealModeAddress, u32)> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    if let Ok(addr) = pool.alloc(size) {
                        prop_assert_eq!(addr.linear() % BLOCK_ALIGN, 0);
                        prop_assert!(pool.contains(addr));
                        for &(other, other_size) in &live {
                            let disjoint = addr.linear() + size <= other.linear()
                                || other.linear() + other_size <= addr.linear();
                            prop_assert!(disjoint);
                        }
                        live.push((addr, size));
                    }
                }
                Op::Free(n) => {
                    if !live.is_empty() {
                        let (addr, _) = live.remove(n % live.len());
                        prop_assert!(pool.free(addr).is_ok());
                    }
                }
            }
            assert_tiles(&pool);
            prop_assert_eq!(pool.allocations().count(), live.len());
        }

        for (addr, _) in live.drain(..) {
            prop_assert!(pool.free(addr).is_ok());
        }
        prop_assert_eq!(pool.blocks().len(), 1);
        prop_assert_eq!(pool.free_bytes(), pool.size());
    }
}
