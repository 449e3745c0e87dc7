#![no_main]

use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use sparkscope_core::call_tree::{CallTreeMerger, MergeMode};
use sparkscope_core::capture::{CaptureSnapshot, StackFrame};
use sparkscope_core::thread_policy::ThreadGrouping;

const TYPES: [&str; 4] = ["app.Server", "app.World", "net.Io", "Ünïcode.タイプ"];
const METHODS: [&str; 4] = ["run", "tick", "<init>", "lambda$0"];
const THREADS: [&str; 5] = ["main", "Worker-1", "Worker-22", "pool #3", "IO"];

fn frame(byte: u8) -> StackFrame {
    let frame = StackFrame::new(
        TYPES[usize::from(byte) % TYPES.len()],
        METHODS[usize::from(byte >> 2) % METHODS.len()],
    )
    .at_line(u32::from(byte >> 4));
    if byte & 0x80 != 0 {
        frame.with_descriptor(format!("({})V", byte & 0x03))
    } else {
        frame
    }
}

/// Each capture: thread count byte, then per thread a name byte, a depth
/// byte and that many frame bytes.
fn decode(data: &[u8]) -> Vec<Vec<CaptureSnapshot>> {
    let mut captures = Vec::new();
    let mut bytes = data.iter().copied();
    while let Some(count) = bytes.next() {
        let mut capture = Vec::new();
        for _ in 0..(count % 4) {
            let (Some(name), Some(depth)) = (bytes.next(), bytes.next()) else {
                break;
            };
            let frames = bytes.by_ref().take(usize::from(depth % 16)).map(frame).collect();
            capture.push(CaptureSnapshot::new(THREADS[usize::from(name) % THREADS.len()], frames));
        }
        captures.push(capture);
    }
    captures
}

fuzz_target!(|data: &[u8]| {
    let Some((&selector, rest)) = data.split_first() else {
        return;
    };
    let mode = if selector & 1 == 0 {
        MergeMode::SameMethod
    } else {
        MergeMode::SeparateParentCalls
    };
    let grouping = match (selector >> 1) % 3 {
        0 => ThreadGrouping::AsOne,
        1 => ThreadGrouping::ByThreadName,
        _ => ThreadGrouping::ByPoolName,
    };
    let captures = decode(rest);
    let interval = Duration::from_millis(4);

    let mut a = CallTreeMerger::new(mode, grouping);
    let mut b = CallTreeMerger::new(mode, grouping);
    for capture in &captures {
        a.merge_capture(capture, interval);
        b.merge_capture(capture, interval);
    }
    assert_eq!(a.export(), b.export());
    assert_eq!(a.capture_count(), captures.len() as u64);

    for tree in a.trees() {
        for (_, node) in tree.nodes() {
            let children: Duration = node.children.values().map(|c| tree.node(*c).total_time).sum();
            assert_eq!(node.total_time, node.self_time + children);
        }
    }
});
