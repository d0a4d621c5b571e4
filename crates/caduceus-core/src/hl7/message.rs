//! The opaque HL7v2 message value and its segment/field accessors.
//!
//! A message is a list of segments separated by carriage returns; a segment
//! is a list of pipe-delimited fields. Component/sub-component grammar is
//! intentionally not modeled here - callers that need it bring their own
//! parser. The accessors below cover exactly what the transport and the
//! durable queue consume.

use super::ack::AckCode;
use crate::error::{AgentError, Result};
use chrono::Utc;
use std::fmt;

/// One HL7 segment: a name plus pipe-delimited fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hl7Segment {
    fields: Vec<String>,
}

impl Hl7Segment {
    /// Build a segment from its raw fields. The first entry is the segment
    /// name (e.g. `"MSH"`).
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    /// Parse a single segment line.
    pub fn parse(line: &str) -> Self {
        Self {
            fields: line.split('|').map(str::to_string).collect(),
        }
    }

    /// The segment name (`MSH`, `MSA`, `PID`, ...).
    pub fn name(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or("")
    }

    /// Get a field by its 1-based HL7 index.
    ///
    /// For MSH the field separator itself is field 1 and the encoding
    /// characters are field 2, so `MSH.10` is the tenth *logical* field
    /// even though it sits at raw index 9.
    pub fn get_field(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return Some(self.name());
        }
        if self.name() == "MSH" {
            match index {
                1 => Some("|"),
                n => self.fields.get(n - 1).map(String::as_str),
            }
        } else {
            self.fields.get(index).map(String::as_str)
        }
    }

    /// Set a field by its 1-based HL7 index, growing the segment with empty
    /// fields as needed. Setting MSH.1 is not supported (it is the
    /// separator itself).
    pub fn set_field(&mut self, index: usize, value: impl Into<String>) {
        let raw = if self.name() == "MSH" {
            if index <= 1 {
                return;
            }
            index - 1
        } else {
            index
        };
        if raw >= self.fields.len() {
            self.fields.resize(raw + 1, String::new());
        }
        self.fields[raw] = value.into();
    }
}

impl fmt::Display for Hl7Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fields.join("|"))
    }
}

/// An HL7v2 message, treated as an opaque value with header accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hl7Message {
    segments: Vec<Hl7Segment>,
}

impl Hl7Message {
    pub fn new(segments: Vec<Hl7Segment>) -> Self {
        Self { segments }
    }

    /// Parse an HL7 message from its wire text.
    ///
    /// Only the envelope is validated: the message must begin with an MSH
    /// segment. Segments split on CR (LF tolerated for convenience).
    pub fn parse(text: &str) -> Result<Self> {
        if !text.starts_with("MSH") {
            return Err(AgentError::Parse {
                message: "message must begin with an MSH segment".to_string(),
            });
        }
        let segments = text
            .split(['\r', '\n'])
            .filter(|line| !line.is_empty())
            .map(Hl7Segment::parse)
            .collect();
        Ok(Self { segments })
    }

    /// The first segment with the given name.
    pub fn get_segment(&self, name: &str) -> Option<&Hl7Segment> {
        self.segments.iter().find(|s| s.name() == name)
    }

    /// Mutable access to the first segment with the given name.
    pub fn get_segment_mut(&mut self, name: &str) -> Option<&mut Hl7Segment> {
        self.segments.iter_mut().find(|s| s.name() == name)
    }

    fn msh_field(&self, index: usize) -> Option<&str> {
        self.get_segment("MSH")?.get_field(index)
    }

    fn msa_field(&self, index: usize) -> Option<&str> {
        self.get_segment("MSA")?.get_field(index)
    }

    /// MSH.10, the message control id used for request correlation.
    /// Empty values are treated as absent.
    pub fn control_id(&self) -> Option<&str> {
        self.msh_field(10).filter(|v| !v.is_empty())
    }

    /// MSH.3, the sending application.
    pub fn sender(&self) -> &str {
        self.msh_field(3).unwrap_or("")
    }

    /// MSH.5, the receiving application.
    pub fn receiver(&self) -> &str {
        self.msh_field(5).unwrap_or("")
    }

    /// MSA.1, the acknowledgment code of an ack message.
    pub fn ack_code(&self) -> Option<&str> {
        self.msa_field(1).filter(|v| !v.is_empty())
    }

    /// MSA.2, the control id this ack is acknowledging.
    /// Empty values are treated as absent.
    pub fn ack_target_id(&self) -> Option<&str> {
        self.msa_field(2).filter(|v| !v.is_empty())
    }

    /// Build an acknowledgment reply for this message.
    ///
    /// The MSH sender/receiver pairs are swapped, the ack message type
    /// mirrors the trigger event of the original (`ACK^A01^ACK` for an
    /// `ADT^A01`), and the MSA carries the original control id.
    pub fn build_ack(&self, code: AckCode) -> Hl7Message {
        let msh = self.get_segment("MSH");
        let field = |i: usize| -> String {
            msh.and_then(|s| s.get_field(i)).unwrap_or("").to_string()
        };
        let now = Utc::now();

        let msh_segment = Hl7Segment::new(vec![
            "MSH".to_string(),
            field(2),
            field(5),
            field(6),
            field(3),
            field(4),
            now.format("%Y%m%d%H%M%S").to_string(),
            String::new(),
            self.build_ack_message_type(),
            now.timestamp_millis().to_string(),
            "P".to_string(),
            {
                let v = field(12);
                if v.is_empty() {
                    "2.5.1".to_string()
                } else {
                    v
                }
            },
        ]);
        let msa_segment = Hl7Segment::new(vec![
            "MSA".to_string(),
            code.as_str().to_string(),
            field(10),
            "OK".to_string(),
        ]);

        Hl7Message::new(vec![msh_segment, msa_segment])
    }

    /// Mirror the trigger event of the original message type (MSH.9 second
    /// component) into the ack's message type.
    fn build_ack_message_type(&self) -> String {
        let message_type = self.msh_field(9).unwrap_or("");
        let mut components = message_type.split('^');
        let _code = components.next();
        let trigger = components.next().unwrap_or("");
        let structure = components.next().unwrap_or("");
        if !trigger.is_empty() && !structure.is_empty() {
            format!("ACK^{}^ACK", trigger)
        } else if !trigger.is_empty() {
            format!("ACK^{}", trigger)
        } else {
            "ACK".to_string()
        }
    }
}

impl fmt::Display for Hl7Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            if !first {
                f.write_str("\r")?;
            }
            write!(f, "{}", segment)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADT: &str = "MSH|^~\\&|ADT1|MCM|LABADT|MCM|198808181126|SECURITY|ADT^A01|MSG00001|P|2.2\r\
        PID|||PATID1234^5^M11||JONES^WILLIAM^A^III||19610615|M-";

    #[test]
    fn test_parse_and_roundtrip() {
        let message = Hl7Message::parse(ADT).unwrap();
        assert_eq!(message.to_string(), ADT);
    }

    #[test]
    fn test_parse_rejects_non_msh() {
        let result = Hl7Message::parse("PID|||PATID1234");
        assert!(matches!(result, Err(AgentError::Parse { .. })));
    }

    #[test]
    fn test_msh_field_offsets() {
        let message = Hl7Message::parse(ADT).unwrap();
        let msh = message.get_segment("MSH").unwrap();
        assert_eq!(msh.get_field(1), Some("|"));
        assert_eq!(msh.get_field(2), Some("^~\\&"));
        assert_eq!(msh.get_field(3), Some("ADT1"));
        assert_eq!(msh.get_field(9), Some("ADT^A01"));
        assert_eq!(msh.get_field(10), Some("MSG00001"));
    }

    #[test]
    fn test_header_accessors() {
        let message = Hl7Message::parse(ADT).unwrap();
        assert_eq!(message.control_id(), Some("MSG00001"));
        assert_eq!(message.sender(), "ADT1");
        assert_eq!(message.receiver(), "LABADT");
        assert_eq!(message.ack_code(), None);
    }

    #[test]
    fn test_empty_control_id_is_absent() {
        let mut message = Hl7Message::parse(ADT).unwrap();
        message.get_segment_mut("MSH").unwrap().set_field(10, "");
        assert_eq!(message.control_id(), None);
    }

    #[test]
    fn test_set_field_grows_segment() {
        let mut segment = Hl7Segment::parse("MSA|AA");
        segment.set_field(5, "extra");
        assert_eq!(segment.get_field(5), Some("extra"));
        assert_eq!(segment.get_field(3), Some(""));
    }

    #[test]
    fn test_build_ack() {
        let message = Hl7Message::parse(ADT).unwrap();
        let ack = message.build_ack(AckCode::AA);

        let msh = ack.get_segment("MSH").unwrap();
        // Sender/receiver pairs are swapped
        assert_eq!(msh.get_field(3), Some("LABADT"));
        assert_eq!(msh.get_field(5), Some("ADT1"));
        assert_eq!(msh.get_field(9), Some("ACK^A01^ACK"));

        assert_eq!(ack.ack_code(), Some("AA"));
        assert_eq!(ack.ack_target_id(), Some("MSG00001"));
    }

    #[test]
    fn test_build_ack_without_trigger() {
        let message = Hl7Message::parse("MSH|^~\\&|A|B|C|D|20240101||ORU|ID1|P|2.3").unwrap();
        let ack = message.build_ack(AckCode::CA);
        assert_eq!(ack.get_segment("MSH").unwrap().get_field(9), Some("ACK"));
        assert_eq!(ack.ack_code(), Some("CA"));
    }
}
