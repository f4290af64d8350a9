//! Streaming reader for `SanctionsEntry` elements of an OFAC advanced XML file.
//!
//! Only the `ProfileID` and `ListID` attributes are read; the rest of the list is ignored.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Result, RiskError};
use crate::risk::direct::Observation;

/// Iterator over the `(ProfileID, ListID)` observations of a sanctions file.
///
/// Entries without one of the attributes yield a blank field, which the loader counts as malformed.
pub struct SanctionsEntries<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    done: bool,
}

impl<R: BufRead> SanctionsEntries<R> {
    pub fn new(reader: Reader<R>) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            done: false,
        }
    }

    fn next_entry(&mut self) -> Result<Option<Observation>> {
        loop {
            self.buf.clear();
            let event = self.reader.read_event_into(&mut self.buf).map_err(|e| {
                RiskError::Parse(format!(
                    "XML error at byte {}: {}",
                    self.reader.buffer_position(),
                    e
                ))
            })?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e)
                    if e.local_name().as_ref() == b"SanctionsEntry" =>
                {
                    return entry_from_element(e).map(Some);
                }
                Event::Eof => return Ok(None),
                _ => {}
            }
        }
    }
}

impl<R: BufRead> Iterator for SanctionsEntries<R> {
    type Item = Result<Observation>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(Some(obs)) => Some(Ok(obs)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn entry_from_element(element: &BytesStart<'_>) -> Result<Observation> {
    let mut profile_id = String::new();
    let mut list_id = String::new();
    for attr in element.attributes() {
        let attr = attr
            .map_err(|e| RiskError::Parse(format!("Bad SanctionsEntry attribute: {}", e)))?;
        let value = || String::from_utf8_lossy(&attr.value).into_owned();
        match attr.key.local_name().as_ref() {
            b"ProfileID" => profile_id = value(),
            b"ListID" => list_id = value(),
            _ => {}
        }
    }
    Ok(Observation::new(profile_id, list_id))
}

/// Open `path` and stream its sanctions entries.
pub fn read_sanctions_entries(path: &Path) -> Result<SanctionsEntries<BufReader<File>>> {
    let reader = Reader::from_file(path)
        .map_err(|e| RiskError::Parse(format!("Cannot open {}: {}", path.display(), e)))?;
    Ok(SanctionsEntries::new(reader))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Sanctions xmlns="https://www.treasury.gov/ofac/DeltaFile/1.0">
  <DistinctParties>
    <DistinctParty FixedRef="36">
      <Profile ID="36" PartySubTypeID="3" />
    </DistinctParty>
  </DistinctParties>
  <SanctionsEntries>
    <SanctionsEntry ID="36" ProfileID="36" ListID="1550">
      <EntryEvent ID="1" EntryEventTypeID="1" LegalBasisID="1" />
    </SanctionsEntry>
    <SanctionsEntry ID="37" ProfileID="173" ListID="91512" />
    <SanctionsEntry ID="38" ListID="1550" />
  </SanctionsEntries>
</Sanctions>"#;

    #[test]
    fn test_reads_profile_and_list_ids() {
        let entries: Vec<Observation> = SanctionsEntries::new(Reader::from_str(SAMPLE))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            entries,
            vec![
                Observation::new("36", "1550"),
                Observation::new("173", "91512"),
                Observation::new("", "1550"),
            ]
        );
    }

    #[test]
    fn test_reads_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sdn_advanced.xml");
        fs::write(&path, SAMPLE).unwrap();
        let count = read_sanctions_entries(&path).unwrap().count();
        assert_eq!(count, 3);
        assert!(read_sanctions_entries(&temp.path().join("missing.xml")).is_err());
    }

    #[test]
    fn test_malformed_xml_is_an_error() {
        let broken =
            "<Sanctions><SanctionsEntry ProfileID=\"1\" ListID=\"1550\"></Wrong></Sanctions>";
        let results: Vec<Result<Observation>> =
            SanctionsEntries::new(Reader::from_str(broken)).collect();
        assert!(results.iter().any(|r| matches!(r, Err(RiskError::Parse(_)))));
    }
}
