//! XWin per-segment hash-table diffing, exercised directly against the
//! hashing primitive without spawning `xwd`.

use nx_remote_controller_daemon::hash::segment_hash;

const NUM_SEGMENTS: usize = 1080;
const SEGMENT_PIXELS: usize = 320;
const EOF_INDEX: u16 = 0x0FFF;

/// Stand-in for `xwin::run_iteration`'s per-segment loop: feed a sequence
/// of synthetic frames (each `NUM_SEGMENTS` heap-allocated pixel buffers)
/// through a persistent hash table and return, for each frame, the list of
/// segment indices whose hash changed plus the EOF marker. `None` in the
/// table means the segment has never been transmitted, so it always
/// counts as changed — a real segment can legitimately hash to 0, so a
/// bare `u32` sentinel can't tell "never sent" from "hashes to zero".
fn diff_frame(table: &mut [Option<u32>; NUM_SEGMENTS], frame: &[Vec<u8>]) -> Vec<u16> {
    let mut emitted = Vec::new();
    for (index, segment) in frame.iter().enumerate() {
        let hash = segment_hash(segment);
        if table[index] == Some(hash) {
            continue;
        }
        table[index] = Some(hash);
        emitted.push(index as u16);
    }
    emitted.push(EOF_INDEX);
    emitted
}

fn blank_frame() -> Vec<Vec<u8>> {
    vec![vec![0u8; SEGMENT_PIXELS * 4]; NUM_SEGMENTS]
}

#[test]
fn blank_first_frame_still_emits_every_segment() {
    let mut table = [None; NUM_SEGMENTS];
    let frame = blank_frame();

    // An all-zero frame hashes to zero everywhere, but the table starts
    // as "never sent" rather than "hashes to zero" — every segment must
    // still be emitted once on the first frame.
    let emitted = diff_frame(&mut table, &frame);
    let mut expected: Vec<u16> = (0..NUM_SEGMENTS as u16).collect();
    expected.push(EOF_INDEX);
    assert_eq!(emitted, expected);
}

#[test]
fn real_segment_hashing_to_zero_is_still_emitted_on_first_appearance() {
    // BGRA pixels with the B channel all zero but G/R/A nonzero: real,
    // non-blank content whose segment_hash nonetheless comes out to 0
    // (the hash only sums every 4th byte, starting at the B channel).
    let mut segment = vec![0u8; SEGMENT_PIXELS * 4];
    for pixel in segment.chunks_exact_mut(4) {
        pixel[1] = 0x40; // G
        pixel[2] = 0x80; // R
        pixel[3] = 0xFF; // A
    }
    assert_eq!(segment_hash(&segment), 0);

    let mut table = [None; NUM_SEGMENTS];
    let mut frame = blank_frame();
    frame[7] = segment;

    let emitted = diff_frame(&mut table, &frame);
    assert!(emitted.contains(&7), "segment 7 must be emitted despite hashing to 0");
}

#[test]
fn only_changed_segments_are_emitted_on_subsequent_frames() {
    let mut table = [None; NUM_SEGMENTS];
    let blank = blank_frame();
    diff_frame(&mut table, &blank);

    let mut next = blank;
    // Mutate a handful of segments, including index 0 — the rewrite does
    // not special-case it the way the original daemon's C source did.
    for &idx in &[0usize, 3, 517, 1079] {
        next[idx][0] = 0xFF;
    }

    let emitted = diff_frame(&mut table, &next);
    assert_eq!(emitted, vec![0, 3, 517, 1079, EOF_INDEX]);
}

#[test]
fn unchanged_segment_is_skipped_on_repeat() {
    let mut table = [None; NUM_SEGMENTS];
    let mut frame = blank_frame();
    frame[10][0] = 0xAB;

    let first = diff_frame(&mut table, &frame);
    assert!(first.contains(&10));

    let second = diff_frame(&mut table, &frame);
    assert_eq!(second, vec![EOF_INDEX]);
}
