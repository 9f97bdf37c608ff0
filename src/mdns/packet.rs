use crate::aggregator::Answer;
use crate::profile::ServiceProfile;
use crate::profile::SERVICE_TYPE;
use hickory_proto::error::ProtoError;
use hickory_proto::op::Message;
use hickory_proto::op::MessageType;
use hickory_proto::op::OpCode;
use hickory_proto::op::Query;
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::rdata::PTR;
use hickory_proto::rr::rdata::SRV;
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::Name;
use hickory_proto::rr::RData;
use hickory_proto::rr::Record;
use hickory_proto::rr::RecordType;
use std::net::Ipv4Addr;
use thiserror::Error;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Shared TTLs of mDNS advertisements.
const POINTER_TTL: u32 = 4500;
const HOST_TTL: u32 = 120;

/// Decodes each received datagram as one DNS message.
#[derive(Default)]
pub struct DnsCodec;

impl Decoder for DnsCodec {
    type Item = Message;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split_to(src.len());
        Some(Message::from_vec(&datagram)).transpose().map_err(Into::into)
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Error from network I/O")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode as a DNS message")]
    Dns(#[from] ProtoError),
}

fn service_name() -> Result<Name, ProtoError> {
    Name::from_utf8(format!("{}.local.", SERVICE_TYPE))
}

/// Active query for all instances of the service type.
pub fn build_query() -> Result<Vec<u8>, ProtoError> {
    let mut message = Message::new();
    message
        .set_id(0)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(false);
    message.add_query(Query::query(service_name()?, RecordType::PTR));
    message.to_vec()
}

/// Unsolicited answer advertising this instance.
pub fn build_announcement(
    profile: &ServiceProfile,
    address: Ipv4Addr,
    flush: bool,
) -> Result<Vec<u8>, ProtoError> {
    build_presence(profile, address, flush, POINTER_TTL, HOST_TTL)
}

/// Goodbye packet: the same record set with zero TTLs.
pub fn build_withdrawal(
    profile: &ServiceProfile,
    address: Ipv4Addr,
) -> Result<Vec<u8>, ProtoError> {
    build_presence(profile, address, false, 0, 0)
}

fn build_presence(
    profile: &ServiceProfile,
    address: Ipv4Addr,
    flush: bool,
    pointer_ttl: u32,
    host_ttl: u32,
) -> Result<Vec<u8>, ProtoError> {
    let service = service_name()?;
    let instance = Name::from_utf8(profile.instance_name())?;
    let host = Name::from_utf8(profile.target_host())?;

    let mut message = Message::new();
    message
        .set_id(0)
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(true);
    message.add_answer(Record::from_rdata(
        service,
        pointer_ttl,
        RData::PTR(PTR(instance.clone())),
    ));
    message.add_answer(Record::from_rdata(
        instance.clone(),
        host_ttl,
        RData::SRV(SRV::new(0, 0, profile.port, host.clone())),
    ));
    message.add_answer(Record::from_rdata(
        instance,
        host_ttl,
        RData::TXT(TXT::new(profile.txt_entries(flush))),
    ));
    if !address.is_unspecified() {
        message.add_answer(Record::from_rdata(host, host_ttl, RData::A(A::from(address))));
    }
    message.to_vec()
}

/// Whether the message queries for instances of our service type.
pub fn is_service_query(message: &Message) -> bool {
    if message.message_type() != MessageType::Query {
        return false;
    }
    let Ok(service) = service_name() else {
        return false;
    };
    let service = canonical(&service);
    message.queries().iter().any(|query| {
        matches!(query.query_type(), RecordType::PTR | RecordType::ANY)
            && canonical(query.name()).eq_ignore_ascii_case(&service)
    })
}

/// Raw records of an answer message, reduced to the shapes the aggregator
/// consumes. Goodbye records and non-IPv4 address families are excluded.
pub fn extract_answers(message: &Message) -> Vec<Answer> {
    message
        .answers()
        .iter()
        .chain(message.additionals().iter())
        .filter(|record| record.ttl() > 0)
        .filter_map(to_answer)
        .collect()
}

/// Instance names withdrawn by this message (zero-TTL service pointers).
pub fn extract_withdrawals(message: &Message) -> Vec<String> {
    let Ok(service) = service_name() else {
        return Vec::new();
    };
    let service = canonical(&service);
    message
        .answers()
        .iter()
        .chain(message.additionals().iter())
        .filter(|record| record.ttl() == 0)
        .filter_map(|record| match record.data() {
            Some(RData::PTR(ptr)) if canonical(record.name()).eq_ignore_ascii_case(&service) => {
                Some(canonical(&ptr.0))
            }
            _ => None,
        })
        .collect()
}

fn to_answer(record: &Record) -> Option<Answer> {
    let name = canonical(record.name());
    match record.data()? {
        RData::PTR(ptr) => Some(Answer::Pointer {
            instance: canonical(&ptr.0),
        }),
        RData::SRV(srv) => Some(Answer::Location {
            name,
            target: canonical(srv.target()),
            port: srv.port(),
        }),
        RData::A(a) => Some(Answer::Address {
            name,
            address: a.0,
        }),
        RData::TXT(txt) => Some(Answer::Text {
            name,
            entries: txt
                .txt_data()
                .iter()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect(),
        }),
        // AAAA in particular: discovery is IPv4 only.
        _ => None,
    }
}

/// Name with the trailing root dot removed; comparisons are done
/// case-insensitively since mDNS names are case-insensitive.
pub fn canonical(name: &Name) -> String {
    let utf8 = name.to_utf8();
    utf8.trim_end_matches('.').to_string()
}
