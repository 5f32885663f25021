/*! Declarative CAN signal table.

The table is loaded from an XML file of the shape:

```xml
<tbox>
  <signal id="640" name="VehicleSpeed" byteorder="LE"
          firstbit="8" bitlength="16" unit="0.05625" offset="0" source="1"/>
  <battery code="PACK0001A"/>
  ...
</tbox>
```

Several `<signal>` entries may share an `id`; all of them are extracted
from every matching frame, in document order. Attribute parsing is
tolerant: a malformed value keeps the attribute's default, and a signal
without an `id` is dropped.

Bit extraction is a pure function over `(bytes, first_bit, bit_length,
byte order)` so it can be tested without any socket plumbing.
*/
use std::collections::HashMap;
use std::path::Path;

use log::{debug, warn};
use quick_xml::Reader;
use quick_xml::events::Event;

use crate::{Error, Result};

/// Bit numbering scheme of one signal inside the frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Intel order, bits accumulate LSB-first.
    #[default]
    Little,
    /// Motorola order, bit-within-byte order reversed per byte.
    Big,
}

/// One parsed `<signal>` entry.
#[derive(Debug, Clone)]
pub struct SignalDescriptor {
    /// CAN identifier the signal lives in.
    pub id: u32,
    /// Metric name the decoded value is published under.
    pub name: String,
    /// Bit numbering scheme.
    pub order: ByteOrder,
    /// Bit offset of the field within the payload.
    pub first_bit: u32,
    /// Field width in bits.
    pub bit_length: u32,
    /// Physical unit multiplier, applied at encoding time.
    pub unit: f64,
    /// Physical offset bias, applied at encoding time.
    pub offset: i64,
    /// 0 matches any CAN interface, N matches interface `can{N-1}`.
    pub source: u8,
}

impl Default for SignalDescriptor {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            order: ByteOrder::Little,
            first_bit: 0,
            bit_length: 0,
            unit: 1.0,
            offset: 0,
            source: 0,
        }
    }
}

/// Extract an unsigned bit-field from a frame payload.
///
/// Returns `None` when the requested window does not fit the payload;
/// the caller skips such descriptors silently. No sign extension is
/// applied here, encoders interpret signedness per field.
#[must_use]
pub fn extract_bits(data: &[u8], first_bit: u32, bit_length: u32, order: ByteOrder) -> Option<u64> {
    if bit_length == 0 || bit_length > 64 {
        return None;
    }
    let total_bits = data.len() as u32 * 8;
    match order {
        ByteOrder::Little => {
            if first_bit + bit_length > total_bits {
                return None;
            }
            let mut value = 0u64;
            for b in 0..bit_length {
                let pos = first_bit + b;
                let bit = (data[(pos / 8) as usize] >> (pos % 8)) & 1;
                value |= u64::from(bit) << b;
            }
            Some(value)
        }
        ByteOrder::Big => {
            let first_byte = first_bit / 8;
            if first_byte >= data.len() as u32 {
                return None;
            }
            // Available bits from the start position down through the
            // lower-numbered bytes.
            let rbits = 8 - first_bit % 8 + first_byte * 8;
            let mut value = 0u64;
            for b in 0..bit_length.min(rbits) {
                let byte = ((rbits - b) / 8) as usize;
                let bit_pos = (first_bit + b) % 8;
                let bit = data.get(byte).copied().unwrap_or(0) >> bit_pos & 1;
                value = (value << 1) | u64::from(bit);
            }
            Some(value)
        }
    }
}

/// Table of signal descriptors indexed by CAN identifier.
#[derive(Debug, Default)]
pub struct SignalTable {
    signals: HashMap<u32, Vec<SignalDescriptor>>,
    battery_codes: Vec<String>,
}

impl SignalTable {
    /// Load a table from a file. See the module docs for the format.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse a table from XML text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut reader = Reader::from_str(text);
        let mut table = Self::default();
        let mut in_tbox = false;
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.name().as_ref() {
                    b"tbox" => in_tbox = true,
                    b"signal" if in_tbox => {
                        let mut sig = SignalDescriptor::default();
                        let mut have_id = false;
                        for attr in e.attributes().flatten() {
                            let Ok(value) = attr.unescape_value() else {
                                continue;
                            };
                            match attr.key.as_ref() {
                                b"id" => {
                                    if let Ok(v) = value.parse() {
                                        sig.id = v;
                                        have_id = true;
                                    }
                                }
                                b"name" => sig.name = value.into_owned(),
                                b"byteorder" => {
                                    if value.eq_ignore_ascii_case("BE") {
                                        sig.order = ByteOrder::Big;
                                    }
                                }
                                b"firstbit" => {
                                    if let Ok(v) = value.parse() {
                                        sig.first_bit = v;
                                    }
                                }
                                b"firstbyte" => {
                                    // Legacy alias: whole-byte offset.
                                    if let Ok(v) = value.parse::<u32>() {
                                        sig.first_bit += v * 8;
                                    }
                                }
                                b"bitlength" => {
                                    if let Ok(v) = value.parse() {
                                        sig.bit_length = v;
                                    }
                                }
                                b"unit" => {
                                    if let Ok(v) = value.parse() {
                                        sig.unit = v;
                                    }
                                }
                                b"offset" => {
                                    if let Ok(v) = value.parse() {
                                        sig.offset = v;
                                    }
                                }
                                b"source" => {
                                    if let Ok(v) = value.parse() {
                                        sig.source = v;
                                    }
                                }
                                _ => {}
                            }
                        }
                        if have_id {
                            debug!("signal table: id {} -> {}", sig.id, sig.name);
                            table.signals.entry(sig.id).or_default().push(sig);
                        } else {
                            warn!("signal table: dropping <signal> without id");
                        }
                    }
                    b"battery" if in_tbox => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"code"
                                && let Ok(value) = attr.unescape_value()
                            {
                                table.battery_codes.push(value.into_owned());
                            }
                        }
                    }
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(Error::SignalTable(e.to_string())),
            }
        }
        Ok(table)
    }

    /// Descriptors registered for a CAN id, in document order.
    #[must_use]
    pub fn descriptors(&self, id: u32) -> &[SignalDescriptor] {
        self.signals.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct CAN ids in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// True when no signal was loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Battery pack codes, in document order.
    #[must_use]
    pub fn battery_codes(&self) -> &[String] {
        &self.battery_codes
    }

    /// Decode one frame payload against the table.
    ///
    /// `source` is the 1-based CAN interface number; descriptors with
    /// source 0 match any interface. Descriptors whose bit window does
    /// not fit the payload are skipped.
    pub fn decode<'a>(
        &'a self,
        source: u8,
        id: u32,
        data: &[u8],
    ) -> Vec<(&'a SignalDescriptor, u64)> {
        let mut out = Vec::new();
        for sig in self.descriptors(id) {
            if sig.source != 0 && sig.source != source {
                continue;
            }
            if let Some(value) = extract_bits(data, sig.first_bit, sig.bit_length, sig.order) {
                out.push((sig, value));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_le_single_byte() {
        let data = [0b1011_0100u8];
        assert_eq!(extract_bits(&data, 2, 3, ByteOrder::Little), Some(0b101));
        assert_eq!(extract_bits(&data, 0, 8, ByteOrder::Little), Some(0xb4));
    }

    #[test]
    fn extract_le_crosses_bytes() {
        // Bits 6..14 spanning two bytes, LSB-first.
        let data = [0b1100_0000u8, 0b0011_1110];
        assert_eq!(extract_bits(&data, 6, 8, ByteOrder::Little), Some(0b1111_1011));
    }

    #[test]
    fn extract_le_whole_word() {
        let data = [0x34, 0x12];
        assert_eq!(extract_bits(&data, 0, 16, ByteOrder::Little), Some(0x1234));
    }

    #[test]
    fn extract_le_out_of_range() {
        let data = [0u8; 2];
        assert_eq!(extract_bits(&data, 10, 8, ByteOrder::Little), None);
        assert_eq!(extract_bits(&data, 0, 0, ByteOrder::Little), None);
        assert_eq!(extract_bits(&data, 0, 65, ByteOrder::Little), None);
    }

    #[test]
    fn extract_be_msb_first() {
        // first_bit 7 addresses the top bit of byte 0; a one-bit field
        // reads exactly that bit.
        let data = [0b1000_0000u8, 0x00];
        assert_eq!(extract_bits(&data, 7, 1, ByteOrder::Big), Some(1));
        let data = [0b0000_0000u8, 0x00];
        assert_eq!(extract_bits(&data, 7, 1, ByteOrder::Big), Some(0));
    }

    #[test]
    fn extract_be_width_capped_by_start() {
        // Starting at bit 6 of byte 0 leaves two bits before the byte
        // boundary; a wider request is truncated to them.
        let data = [0b0100_0000u8, 0x00];
        assert_eq!(extract_bits(&data, 6, 8, ByteOrder::Big), Some(0b10));
    }

    #[test]
    fn extract_be_first_byte_out_of_range() {
        let data = [0u8; 2];
        assert_eq!(extract_bits(&data, 16, 4, ByteOrder::Big), None);
    }

    #[test]
    fn parse_minimal_table() {
        let xml = r#"
            <tbox>
              <signal id="640" name="VehicleSpeed" byteorder="LE"
                      firstbit="8" bitlength="16" unit="0.05625"/>
              <signal id="640" name="ODO" firstbit="24" bitlength="24"
                      unit="0.1" offset="0" source="2"/>
              <signal id="641" name="actSOC" byteorder="be" firstbit="7"
                      bitlength="8"/>
              <battery code="PACK0001A"/>
            </tbox>"#;
        let table = SignalTable::parse(xml).unwrap();
        assert_eq!(table.len(), 2);
        let sigs = table.descriptors(640);
        assert_eq!(sigs.len(), 2);
        assert_eq!(sigs[0].name, "VehicleSpeed");
        assert_eq!(sigs[0].order, ByteOrder::Little);
        assert!((sigs[0].unit - 0.05625).abs() < 1e-9);
        assert_eq!(sigs[1].name, "ODO");
        assert_eq!(sigs[1].source, 2);
        let soc = &table.descriptors(641)[0];
        assert_eq!(soc.order, ByteOrder::Big);
        assert_eq!(table.battery_codes(), &["PACK0001A".to_string()]);
    }

    #[test]
    fn parse_drops_signal_without_id() {
        let xml = r#"<tbox><signal name="orphan" bitlength="8"/></tbox>"#;
        let table = SignalTable::parse(xml).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn parse_tolerates_bad_numbers() {
        let xml = r#"<tbox><signal id="7" name="x" bitlength="oops" unit="nah"/></tbox>"#;
        let table = SignalTable::parse(xml).unwrap();
        let sig = &table.descriptors(7)[0];
        assert_eq!(sig.bit_length, 0);
        assert!((sig.unit - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn decode_filters_by_source() {
        let xml = r#"
            <tbox>
              <signal id="10" name="anysrc" firstbit="0" bitlength="8"/>
              <signal id="10" name="can1only" firstbit="0" bitlength="8" source="2"/>
            </tbox>"#;
        let table = SignalTable::parse(xml).unwrap();
        let from_can0 = table.decode(1, 10, &[0x42]);
        assert_eq!(from_can0.len(), 1);
        assert_eq!(from_can0[0].0.name, "anysrc");
        let from_can1 = table.decode(2, 10, &[0x42]);
        assert_eq!(from_can1.len(), 2);
        assert!(from_can1.iter().all(|(_, v)| *v == 0x42));
    }

    #[test]
    fn decode_skips_unfit_window() {
        let xml = r#"<tbox><signal id="10" name="wide" firstbit="0" bitlength="64"/></tbox>"#;
        let table = SignalTable::parse(xml).unwrap();
        assert!(table.decode(1, 10, &[0u8; 4]).is_empty());
        assert_eq!(table.decode(1, 10, &[0u8; 8]).len(), 1);
    }
}
