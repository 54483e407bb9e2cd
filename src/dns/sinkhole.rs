//! Synthesized answers for blocked domains.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use hickory_proto::serialize::binary::BinEncodable;

use crate::error::{Result, ValidationError};

/// Address a blocked name resolves to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SinkholeAddress {
    /// 127.0.0.1
    #[default]
    Loopback,
    Fixed(Ipv4Addr),
}

impl SinkholeAddress {
    pub const fn ip(self) -> Ipv4Addr {
        match self {
            Self::Loopback => Ipv4Addr::LOCALHOST,
            Self::Fixed(ip) => ip,
        }
    }
}

impl FromStr for SinkholeAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("loopback") {
            return Ok(Self::Loopback);
        }
        s.parse()
            .map(Self::Fixed)
            .map_err(|_| ValidationError::InvalidSinkholeAddress {
                value: s.to_owned(),
            })
    }
}

impl fmt::Display for SinkholeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loopback => f.write_str("loopback"),
            Self::Fixed(ip) => ip.fmt(f),
        }
    }
}

/// The answer handed out for blocked names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sinkhole {
    pub address: SinkholeAddress,
    pub ttl: u32,
}

impl Default for Sinkhole {
    fn default() -> Self {
        Self {
            address: SinkholeAddress::Loopback,
            ttl: 10,
        }
    }
}

impl Sinkhole {
    pub const fn new(address: SinkholeAddress, ttl: u32) -> Self {
        Self { address, ttl }
    }

    /// Turn `query` into a blocked answer.
    ///
    /// The result is the query itself with the response flag set and a
    /// single `A` record appended for the first question, carrying that
    /// question's name and class. Header fields and the question section
    /// are otherwise untouched.
    pub fn blocked_answer(&self, query: &Message) -> Message {
        let mut response = query.clone();
        response.set_message_type(MessageType::Response);

        if let Some(question) = query.queries().first() {
            let mut record = Record::from_rdata(
                question.name().clone(),
                self.ttl,
                RData::A(A(self.address.ip())),
            );
            record.set_dns_class(question.query_class());
            response.add_answer(record);
        }

        response
    }

    /// Encoded form of [`Sinkhole::blocked_answer`].
    pub fn blocked_answer_bytes(&self, query: &Message) -> Result<Vec<u8>> {
        Ok(self.blocked_answer(query).to_bytes()?)
    }
}
