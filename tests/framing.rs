use anyhow::Result;
use gridflow::net::frame::{
    decode_payload, encode_frame, extract_frames, MetaHeader, PackageType, META_SIZE,
};

fn text_frame(text: &str, src: u64) -> Vec<u8> {
    encode_frame(PackageType::Text, src, 0, &text.to_string()).unwrap()
}

#[test]
fn single_frame_round_trip() -> Result<()> {
    let mut buf = text_frame("hello fabric", 42);
    let filled = buf.len();
    buf.resize(filled + 64, 0);

    let mut seen = Vec::new();
    let leftover = extract_frames(&mut buf, filled, |header, payload| {
        seen.push((header.src_uuid, decode_payload::<String>(payload).unwrap()));
    });
    assert_eq!(leftover, 0);
    assert_eq!(seen, vec![(42, "hello fabric".to_string())]);
    Ok(())
}

#[test]
fn n_frames_plus_partial_reports_partial_at_start() -> Result<()> {
    // Invariant: N complete frames followed by a k-byte partial frame
    // produce exactly N callbacks and k unprocessed bytes at buffer start.
    let frames = [
        text_frame("one", 1),
        text_frame("two", 2),
        text_frame("three", 3),
    ];
    let partial_full = text_frame("partial", 9);
    let k = META_SIZE + 3; // cut inside the payload
    let partial = &partial_full[..k];

    let mut buf: Vec<u8> = Vec::new();
    for frame in &frames {
        buf.extend_from_slice(frame);
    }
    buf.extend_from_slice(partial);
    let filled = buf.len();
    buf.resize(filled + 256, 0);

    let mut seen = Vec::new();
    let leftover = extract_frames(&mut buf, filled, |header, _| seen.push(header.src_uuid));

    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(leftover, k);
    assert_eq!(&buf[..k], partial);
    Ok(())
}

#[test]
fn resumes_after_partial_completes() -> Result<()> {
    let frame = text_frame("delayed", 7);
    let split = META_SIZE + 2;

    let mut buf = vec![0u8; 1024];
    buf[..split].copy_from_slice(&frame[..split]);

    let mut seen = 0;
    let leftover = extract_frames(&mut buf, split, |_, _| seen += 1);
    assert_eq!(seen, 0);
    assert_eq!(leftover, split);

    // The rest of the frame arrives behind the kept tail.
    buf[split..frame.len()].copy_from_slice(&frame[split..]);
    let leftover = extract_frames(&mut buf, frame.len(), |_, _| seen += 1);
    assert_eq!(seen, 1);
    assert_eq!(leftover, 0);
    Ok(())
}

#[test]
fn garbage_before_magic_is_skipped() -> Result<()> {
    let frame = text_frame("after noise", 5);
    let mut buf = vec![0xEEu8; 7];
    buf.extend_from_slice(&frame);
    let filled = buf.len();
    buf.resize(filled + 64, 0);

    let mut seen = 0;
    let leftover = extract_frames(&mut buf, filled, |_, _| seen += 1);
    assert_eq!(seen, 1);
    assert_eq!(leftover, 0);
    Ok(())
}

#[test]
fn header_fields_survive_the_wire() -> Result<()> {
    let bytes = encode_frame(PackageType::QueryPlan, 0xAB, 0xCD, &"payload".to_string())?;
    let header = MetaHeader::read_from(&bytes).unwrap();
    assert_eq!(header.package_type, PackageType::QueryPlan);
    assert_eq!(header.src_uuid, 0xAB);
    assert_eq!(header.tgt_uuid, 0xCD);
    assert_eq!(header.frame_size(), bytes.len());
    Ok(())
}
