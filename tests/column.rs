use anyhow::Result;
use gridflow::column::{Column, DataType};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn complete_column_round_trip() -> Result<()> {
    let col = Arc::new(Column::new(DataType::UInt64, 8, true, None));
    col.allocate();
    col.write_slice(0, &[1u64, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(col.as_slice::<u64>(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert!(col.is_complete());
    Ok(())
}

#[test]
fn watermark_is_monotone_and_bounded() -> Result<()> {
    let col = Arc::new(Column::new(DataType::UInt64, 4, false, None));
    col.allocate();
    assert_eq!(col.written_bytes(), 0);
    col.advance(8);
    assert_eq!(col.written_bytes(), 8);
    col.advance(8);
    assert_eq!(col.written_bytes(), 16);
    // Advancing past the end clamps and completes.
    col.advance(1 << 20);
    assert_eq!(col.written_bytes(), 32);
    assert!(col.is_complete());
    Ok(())
}

#[test]
fn chunk_cursor_yields_exact_chunks() -> Result<()> {
    let col = Arc::new(Column::new(DataType::UInt32, 10, true, None));
    col.allocate();
    col.write_slice(0, &[0u32, 1, 2, 3, 4, 5, 6, 7, 8, 9]);

    let mut cursor = col.chunks::<u32>(4);
    assert!(!cursor.is_last_chunk());
    assert_eq!(cursor.next().unwrap(), &[0, 1, 2, 3]);
    assert_eq!(cursor.next().unwrap(), &[4, 5, 6, 7]);
    // 10 % 4 == 2 elements in the last chunk.
    assert_eq!(cursor.next().unwrap(), &[8, 9]);
    assert!(cursor.next().is_none());
    Ok(())
}

#[test]
fn exact_multiple_has_full_last_chunk() -> Result<()> {
    let col = Arc::new(Column::new(DataType::UInt64, 8, true, None));
    col.allocate();
    col.write_slice(0, &[0u64, 1, 2, 3, 4, 5, 6, 7]);

    let mut cursor = col.chunks::<u64>(4);
    assert_eq!(cursor.next().unwrap().len(), 4);
    assert!(cursor.is_last_chunk());
    assert_eq!(cursor.next().unwrap().len(), 4);
    assert!(cursor.next().is_none());
    Ok(())
}

#[test]
fn reader_blocks_until_producer_advances() -> Result<()> {
    let col = Arc::new(Column::new(DataType::UInt64, 1024, false, None));
    col.allocate();

    let producer_col = Arc::clone(&col);
    let producer = thread::spawn(move || {
        let values: Vec<u64> = (0..1024u64).collect();
        for step in 0..4 {
            let offset = step * 256;
            producer_col.write_slice(offset, &values[offset..offset + 256]);
            producer_col.advance(256 * 8);
            thread::sleep(Duration::from_millis(10));
        }
    });

    let mut cursor = col.chunks::<u64>(256);
    let mut seen: Vec<u64> = Vec::new();
    while let Some(chunk) = cursor.next() {
        seen.extend_from_slice(chunk);
    }
    producer.join().unwrap();

    assert_eq!(seen.len(), 1024);
    assert_eq!(seen, (0..1024u64).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn double_allocation_is_a_no_op() -> Result<()> {
    let col = Arc::new(Column::new(DataType::UInt64, 4, true, None));
    col.allocate();
    col.write_slice(0, &[7u64, 7, 7, 7]);
    // Second allocation must not discard the data.
    col.allocate();
    assert_eq!(col.as_slice::<u64>(), &[7, 7, 7, 7]);
    Ok(())
}

#[test]
fn wait_allocated_unblocks_on_allocation() -> Result<()> {
    let col = Arc::new(Column::new(DataType::UInt64, 4, true, None));
    let waiter_col = Arc::clone(&col);
    let waiter = thread::spawn(move || {
        waiter_col.wait_allocated();
        true
    });
    thread::sleep(Duration::from_millis(20));
    col.allocate();
    assert!(waiter.join().unwrap());
    Ok(())
}

#[test]
fn numa_tag_is_carried() -> Result<()> {
    let col = Column::new(DataType::Int32, 16, true, Some(1));
    assert_eq!(col.numa_node(), Some(1));
    assert_eq!(col.size_bytes(), 64);
    Ok(())
}
