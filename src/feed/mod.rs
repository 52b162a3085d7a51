//! Inbound notification payloads: hub Atom deliveries, manual JSON
//! submissions and delivery signatures.

pub mod parser;
pub mod signature;

pub use parser::{
    AtomPayload, FeedEntry, ManualSubmission, ParseError, is_xml_payload, item_id_from_url,
    parse_atom, parse_manual,
};
pub use signature::{SIGNATURE_HEADER, verify_signature};
