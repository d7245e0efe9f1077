#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use boundary_alloc_hater::HeapSubject;
use libfuzzer_sys::fuzz_target;

const MAX_REGION: usize = 1024 * 1024;

#[derive(Clone, Debug)]
struct Args {
    region_size: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let region_size = 1 + usize::arbitrary(un)? % MAX_REGION;
        let ops = Vec::arbitrary(un)?;

        Ok(Args { region_size, ops })
    }
}

fuzz_target!(|args: Args| {
    let Args { region_size, ops } = args;

    let heap = match HeapSubject::new(region_size) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(heap);
    eval.evaluate(ops).unwrap();
});
