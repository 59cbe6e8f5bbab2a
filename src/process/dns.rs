//! Passive DNS process plugin.
//!
//! Watches responses from source port 53 and collects A, AAAA and PTR
//! answers on the flow. PTR owner names under `in-addr.arpa` / `ip6.arpa`
//! are converted back to the address they describe; the IPv6 form packs
//! pairs of adjacent nibble labels into bytes. A parsed response marks the
//! flow for immediate export — a DNS exchange is complete per message.

use std::any::Any;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;

use nom::IResult;
use nom::number::complete::{be_u16, be_u32};
use nom::sequence::tuple;
use nom_derive::{Nom, Parse};
use serde::Serialize;
use tracing::trace;

use crate::cache::record::FlowRecord;
use crate::packet::{IPPROTO_TCP, Packet};
use crate::process::{
    Extension, ExtensionId, ParserAction, ProcessPlugin, register_extension,
};

static DNS_EXTENSION_ID: OnceLock<ExtensionId> = OnceLock::new();

/// The process-wide extension id of [`DnsExtension`].
pub fn dns_extension_id() -> ExtensionId {
    *DNS_EXTENSION_ID.get_or_init(register_extension)
}

/// DNS port watched by the plugin.
pub const DNS_PORT: u16 = 53;

const DNS_TYPE_A: u16 = 1;
const DNS_TYPE_PTR: u16 = 12;
const DNS_TYPE_AAAA: u16 = 28;

/// Label-pointer chains longer than this abort name decompression.
const MAX_LABEL_COUNT: usize = 127;

/// Resource-record kind collected by the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DnsRecordType {
    /// IPv4 address record.
    A,
    /// IPv6 address record.
    Aaaa,
    /// Reverse-lookup pointer record.
    Ptr,
}

/// One collected DNS answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsRecord {
    /// Transaction id of the carrying message.
    pub id: u16,
    /// For A/AAAA the owner name; for PTR the target domain.
    pub name: String,
    /// Resource-record TTL.
    pub rr_ttl: u32,
    /// Record kind.
    pub rtype: DnsRecordType,
    /// For A/AAAA the answer address; for PTR the address reconstructed
    /// from the owner name.
    pub addr: IpAddr,
}

/// DNS answers attached to a flow.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DnsExtension {
    /// Collected answers, in message order.
    pub records: Vec<DnsRecord>,
}

impl Extension for DnsExtension {
    fn id(&self) -> ExtensionId {
        dns_extension_id()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Nom)]
struct DnsHeader {
    id: u16,
    #[allow(dead_code)]
    flags: u16,
    question_count: u16,
    answer_count: u16,
    #[allow(dead_code)]
    authority_count: u16,
    #[allow(dead_code)]
    additional_count: u16,
}

const DNS_HEADER_LEN: usize = 12;
const DNS_QUESTION_TAIL: usize = 4;
const DNS_ANSWER_FIXED: usize = 10;

/// Passive DNS collector hooked at `post_create` and `post_update`.
#[derive(Debug, Default)]
pub struct DnsPlugin {
    total: u64,
    parsed_a: u64,
    parsed_aaaa: u64,
    parsed_ptr: u64,
}

impl DnsPlugin {
    /// Fresh plugin with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// DNS payloads inspected so far.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Parsed A records so far.
    pub fn parsed_a(&self) -> u64 {
        self.parsed_a
    }

    /// Parsed AAAA records so far.
    pub fn parsed_aaaa(&self) -> u64 {
        self.parsed_aaaa
    }

    /// Parsed PTR records so far.
    pub fn parsed_ptr(&self) -> u64 {
        self.parsed_ptr
    }

    fn collect(&mut self, flow: &mut FlowRecord, pkt: &Packet<'_>) -> ParserAction {
        self.total += 1;
        let Some(records) = parse_dns(pkt.payload, pkt.proto == IPPROTO_TCP) else {
            return ParserAction::Continue;
        };

        for rec in &records {
            match rec.rtype {
                DnsRecordType::A => self.parsed_a += 1,
                DnsRecordType::Aaaa => self.parsed_aaaa += 1,
                DnsRecordType::Ptr => self.parsed_ptr += 1,
            }
        }

        if !records.is_empty() {
            let id = dns_extension_id();
            if flow.extension::<DnsExtension>(id).is_none() {
                let _ = flow.add_extension(Box::new(DnsExtension::default()));
            }
            if let Some(ext) = flow.extension_mut::<DnsExtension>(id) {
                ext.records.extend(records);
            }
        }
        trace!("dns response collected, exporting flow");
        ParserAction::Export
    }
}

impl ProcessPlugin for DnsPlugin {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn extension_id(&self) -> Option<ExtensionId> {
        Some(dns_extension_id())
    }

    fn make_extension(&self) -> Option<Box<dyn Extension>> {
        Some(Box::new(DnsExtension::default()))
    }

    fn post_create(&mut self, flow: &mut FlowRecord, pkt: &Packet<'_>) -> ParserAction {
        if pkt.src_port == DNS_PORT {
            self.collect(flow, pkt)
        } else {
            ParserAction::Continue
        }
    }

    fn post_update(&mut self, flow: &mut FlowRecord, pkt: &Packet<'_>) -> ParserAction {
        if pkt.src_port == DNS_PORT {
            self.collect(flow, pkt)
        } else {
            ParserAction::Continue
        }
    }
}

/// Parses a DNS response payload into collected answer records.
///
/// Over TCP the message is preceded by a 2-byte length that must match the
/// remaining payload exactly (fragmented messages are skipped).
pub fn parse_dns(payload: &[u8], tcp: bool) -> Option<Vec<DnsRecord>> {
    let msg = if tcp {
        if payload.len() < 2 {
            return None;
        }
        let declared = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        if declared != payload.len() - 2 {
            return None;
        }
        &payload[2..]
    } else {
        payload
    };

    if msg.len() < DNS_HEADER_LEN {
        return None;
    }
    let (_, header) = DnsHeader::parse(msg).ok()?;

    let mut offset = DNS_HEADER_LEN;
    for _ in 0..header.question_count {
        offset += name_wire_len(msg, offset)?;
        offset = offset.checked_add(DNS_QUESTION_TAIL)?;
        if offset > msg.len() {
            return None;
        }
    }

    let mut records = Vec::new();
    for _ in 0..header.answer_count {
        let owner = decode_name(msg, offset)?;
        offset += name_wire_len(msg, offset)?;
        if offset + DNS_ANSWER_FIXED > msg.len() {
            return None;
        }

        let fixed: IResult<&[u8], (u16, u16, u32, u16)> =
            tuple((be_u16, be_u16, be_u32, be_u16))(&msg[offset..]);
        let (_, (atype, _aclass, ttl, rdlength)) = fixed.ok()?;
        offset += DNS_ANSWER_FIXED;
        let rdlength = rdlength as usize;
        if offset + rdlength > msg.len() {
            return None;
        }
        let rdata = &msg[offset..offset + rdlength];

        match atype {
            DNS_TYPE_A if rdlength == 4 => {
                records.push(DnsRecord {
                    id: header.id,
                    name: owner,
                    rr_ttl: ttl,
                    rtype: DnsRecordType::A,
                    addr: IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])),
                });
            }
            DNS_TYPE_AAAA if rdlength == 16 => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(rdata);
                records.push(DnsRecord {
                    id: header.id,
                    name: owner,
                    rr_ttl: ttl,
                    rtype: DnsRecordType::Aaaa,
                    addr: IpAddr::V6(Ipv6Addr::from(bytes)),
                });
            }
            DNS_TYPE_PTR => {
                let target = decode_name(msg, offset)?;
                if let Some(addr) = ptr_owner_to_addr(&owner) {
                    records.push(DnsRecord {
                        id: header.id,
                        name: target,
                        rr_ttl: ttl,
                        rtype: DnsRecordType::Ptr,
                        addr,
                    });
                }
            }
            _ => {}
        }

        offset += rdlength;
    }

    Some(records)
}

/// Bytes the name occupies at `offset` in the message (a pointer ends the
/// walk at two bytes).
fn name_wire_len(msg: &[u8], offset: usize) -> Option<usize> {
    let mut len = 0usize;
    let mut pos = offset;
    loop {
        let byte = *msg.get(pos)?;
        if byte == 0 {
            return Some(len + 1);
        }
        if byte & 0xC0 == 0xC0 {
            msg.get(pos + 1)?;
            return Some(len + 2);
        }
        len += byte as usize + 1;
        pos += byte as usize + 1;
    }
}

/// Decompresses the name at `offset`, following pointers with a bounded
/// label budget.
fn decode_name(msg: &[u8], offset: usize) -> Option<String> {
    let mut name = String::new();
    let mut pos = offset;
    let mut labels = 0usize;

    loop {
        let byte = *msg.get(pos)?;
        if byte == 0 {
            break;
        }
        if byte & 0xC0 == 0xC0 {
            let low = *msg.get(pos + 1)?;
            pos = (((byte & 0x3F) as usize) << 8) | low as usize;
            labels += 1;
            if labels > MAX_LABEL_COUNT || pos >= msg.len() {
                return None;
            }
            continue;
        }

        let label_len = byte as usize;
        if label_len > 63 {
            return None;
        }
        labels += 1;
        if labels > MAX_LABEL_COUNT {
            return None;
        }
        let label = msg.get(pos + 1..pos + 1 + label_len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        pos += label_len + 1;
    }

    Some(name)
}

/// Reconstructs the address a PTR owner name describes, or `None` when the
/// name is not a well-formed reverse-lookup domain.
fn ptr_owner_to_addr(owner: &str) -> Option<IpAddr> {
    let name = owner.trim_end_matches('.').to_ascii_lowercase();

    if let Some(prefix) = name.strip_suffix(".in-addr.arpa") {
        let mut octets = [0u8; 4];
        let mut count = 0usize;
        for part in prefix.split('.') {
            if count >= 4 {
                return None;
            }
            octets[3 - count] = part.parse().ok()?;
            count += 1;
        }
        if count != 4 {
            return None;
        }
        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
    }

    if let Some(prefix) = name.strip_suffix(".ip6.arpa") {
        let mut nibbles = [0u8; 32];
        let mut count = 0usize;
        for part in prefix.split('.') {
            if count >= 32 || part.len() != 1 {
                return None;
            }
            let nibble = u8::from_str_radix(part, 16).ok()?;
            nibbles[31 - count] = nibble;
            count += 1;
        }
        if count != 32 {
            return None;
        }
        // Adjacent nibble pairs form each address byte.
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (nibbles[2 * i] << 4) | nibbles[2 * i + 1];
        }
        return Some(IpAddr::V6(Ipv6Addr::from(bytes)));
    }

    None
}
