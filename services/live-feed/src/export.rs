//! CSV export of the cached values
//!
//! One row per cached key, sorted by key. The header is `key` followed by
//! the union of field names across all records, sorted; a record without
//! a given field leaves that cell empty.

use std::collections::BTreeSet;
use std::io;

use feed_types::record::LiveRecord;

use crate::store::LiveValueStore;

/// Write the store's current contents as CSV.
pub fn write_csv<T, W>(store: &LiveValueStore<T>, writer: W) -> Result<(), csv::Error>
where
    T: LiveRecord,
    W: io::Write,
{
    let rows: Vec<(String, _)> = store
        .snapshot()
        .into_iter()
        .map(|(key, record)| (key, record.field_values()))
        .collect();

    let columns: BTreeSet<&str> = rows
        .iter()
        .flat_map(|(_, fields)| fields.keys().map(String::as_str))
        .collect();

    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(std::iter::once("key").chain(columns.iter().copied()))?;
    for (key, fields) in &rows {
        let cells = columns
            .iter()
            .map(|column| fields.get(*column).map(String::as_str).unwrap_or(""));
        wtr.write_record(std::iter::once(key.as_str()).chain(cells))?;
    }
    wtr.flush()?;
    Ok(())
}
