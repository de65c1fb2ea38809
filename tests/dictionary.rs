use anyhow::Result;
use gridflow::dictionary::Dictionary;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn encode_assigns_dense_codes() -> Result<()> {
    let dict = Dictionary::new();
    assert_eq!(dict.encode("germany"), 0);
    assert_eq!(dict.encode("france"), 1);
    assert_eq!(dict.encode("germany"), 0);
    assert_eq!(dict.len(), 2);
    assert_eq!(dict.value_for(1).as_deref(), Some("france"));
    assert!(dict.contains_value("france"));
    assert!(!dict.contains_code(17));
    Ok(())
}

#[test]
fn range_query_is_inclusive() -> Result<()> {
    let dict = Dictionary::new();
    let a = dict.encode("apple");
    let b = dict.encode("banana");
    let c = dict.encode("cherry");
    let in_range = dict.codes_in_range("apple", "banana");
    assert!(in_range.contains(&a));
    assert!(in_range.contains(&b));
    assert!(!in_range.contains(&c));
    Ok(())
}

#[test]
fn like_pattern_supports_multiple_wildcard_runs() -> Result<()> {
    let dict = Dictionary::new();
    let warehouse = dict.encode("warehouse");
    let wardrobe = dict.encode("wardrobe");
    let house = dict.encode("house");

    let matches = dict.matching_codes("war%");
    assert!(matches.contains(&warehouse));
    assert!(matches.contains(&wardrobe));
    assert!(!matches.contains(&house));

    let matches = dict.matching_codes("%a%o%");
    assert!(matches.contains(&wardrobe));
    assert!(!matches.contains(&house));
    Ok(())
}

#[test]
fn serialized_layout_is_code_len_bytes() -> Result<()> {
    let dict = Dictionary::new();
    dict.encode("xy");
    let bytes = dict.serialize();
    assert_eq!(bytes.len(), 8 + 8 + 2);
    assert_eq!(u64::from_le_bytes(bytes[0..8].try_into()?), 0);
    assert_eq!(u64::from_le_bytes(bytes[8..16].try_into()?), 2);
    assert_eq!(&bytes[16..], b"xy");
    Ok(())
}

#[test]
fn deserialize_rebuilds_and_sets_ready() -> Result<()> {
    let dict = Dictionary::new();
    dict.encode("north");
    dict.encode("south");
    dict.encode("east");
    let bytes = dict.serialize();

    let rebuilt = Dictionary::deserialize(&bytes)?;
    assert!(rebuilt.is_ready());
    assert_eq!(rebuilt.len(), 3);
    assert_eq!(rebuilt.code_for("south"), Some(1));
    assert_eq!(rebuilt.value_for(2).as_deref(), Some("east"));
    Ok(())
}

#[test]
fn deserialize_rejects_truncated_input() {
    let dict = Dictionary::new();
    dict.encode("abcdef");
    let bytes = dict.serialize();
    assert!(Dictionary::deserialize(&bytes[..bytes.len() - 1]).is_err());
}

#[test]
fn readers_block_until_ready() -> Result<()> {
    let dict = Arc::new(Dictionary::new());
    dict.encode("pending");

    let waiter_dict = Arc::clone(&dict);
    let waiter = thread::spawn(move || {
        waiter_dict.wait_ready();
        waiter_dict.code_for("pending")
    });

    thread::sleep(Duration::from_millis(20));
    assert!(!dict.is_ready());
    dict.set_ready();
    assert_eq!(waiter.join().unwrap(), Some(0));
    Ok(())
}
