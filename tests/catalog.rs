use anyhow::Result;
use gridflow::catalog::Catalog;
use gridflow::column::{Column, DataType};
use gridflow::testing::base_u64_column;
use std::sync::Arc;

#[test]
fn add_get_remove() -> Result<()> {
    let catalog = Catalog::new();
    base_u64_column(&catalog, "orders", "price", &[10, 20, 30]);

    assert!(catalog.get("orders", "price").is_some());
    assert!(catalog.get("orders", "missing").is_none());
    assert!(catalog.get("missing", "price").is_none());

    assert_eq!(catalog.remove("orders", "price"), 1);
    assert_eq!(catalog.remove("orders", "price"), 0);
    assert!(catalog.get("orders", "price").is_none());
    Ok(())
}

#[test]
fn add_fails_on_ident_collision() -> Result<()> {
    let catalog = Catalog::new();
    base_u64_column(&catalog, "t", "a", &[1]);

    let duplicate = Arc::new(Column::new(DataType::UInt64, 1, true, None));
    assert!(catalog.add("t", "a", duplicate).is_none());
    assert_eq!(catalog.column_count(), 1);
    Ok(())
}

#[test]
fn drop_table_reports_erased_count() -> Result<()> {
    let catalog = Catalog::new();
    base_u64_column(&catalog, "t", "a", &[1]);
    base_u64_column(&catalog, "t", "b", &[2]);
    base_u64_column(&catalog, "u", "c", &[3]);

    assert_eq!(catalog.drop_table("t"), 2);
    assert_eq!(catalog.drop_table("t"), 0);
    assert_eq!(catalog.column_count(), 1);
    Ok(())
}

#[test]
fn held_handles_survive_removal() -> Result<()> {
    let catalog = Catalog::new();
    base_u64_column(&catalog, "t", "a", &[5, 6, 7]);

    let handle = catalog.get("t", "a").unwrap();
    catalog.drop_table("t");
    // The backing buffer lives until the last holder releases it.
    assert_eq!(handle.as_slice::<u64>(), &[5, 6, 7]);
    Ok(())
}

#[test]
fn clear_purges_everything() -> Result<()> {
    let catalog = Catalog::new();
    base_u64_column(&catalog, "a", "x", &[1]);
    base_u64_column(&catalog, "b", "y", &[2]);
    catalog.clear();
    assert_eq!(catalog.column_count(), 0);
    // The registry stays usable after a clear.
    base_u64_column(&catalog, "a", "x", &[1]);
    assert_eq!(catalog.column_count(), 1);
    Ok(())
}

#[test]
fn total_size_includes_dictionaries() -> Result<()> {
    let catalog = Catalog::new();
    base_u64_column(&catalog, "t", "a", &[1, 2, 3, 4]);
    let plain = catalog.total_size();
    assert_eq!(plain, 32);

    gridflow::testing::base_string_column(&catalog, "t", "s", &["aa", "bb"]);
    assert!(catalog.total_size() > plain + 16);
    Ok(())
}
