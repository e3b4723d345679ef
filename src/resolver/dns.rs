//! Minimal DNS message codec, enough for operational discovery over multicast DNS.

use std::{
    collections::BTreeMap,
    io::{Cursor, Read, Write},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};

use anyhow::{Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub const TYPE_A: u16 = 1;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const CLASS_IN: u16 = 1;

const FLAG_RESPONSE: u16 = 0x8000;
const MAX_LABEL_LEN: usize = 63;
/// compression pointers followed per name before giving up
const MAX_POINTER_JUMPS: usize = 16;

pub fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<()> {
    for seg in name.split('.').filter(|s| !s.is_empty()) {
        let bytes = seg.as_bytes();
        if bytes.len() > MAX_LABEL_LEN {
            anyhow::bail!("label {} too long", seg);
        }
        out.write_u8(bytes.len() as u8)?;
        out.write_all(bytes)?;
    }
    out.write_u8(0)?;
    Ok(())
}

pub fn create_query(name: &str, qtype: u16) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(512);
    out.write_u16::<BigEndian>(0)?; // transaction id
    out.write_u16::<BigEndian>(0)?; // flags
    out.write_u16::<BigEndian>(1)?; // questions
    out.write_u16::<BigEndian>(0)?; // answers
    out.write_u16::<BigEndian>(0)?; // authority
    out.write_u16::<BigEndian>(0)?; // additional

    encode_name(name, &mut out)?;

    out.write_u16::<BigEndian>(qtype)?;
    out.write_u16::<BigEndian>(CLASS_IN)?;
    Ok(out)
}

/// Read a possibly compressed name; returned without the trailing dot.
fn read_name(data: &[u8], cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = cursor.position() as usize;
    let mut resume = None;
    let mut jumps = 0;
    loop {
        let n = *data.get(pos).context("name runs past end of message")?;
        pos += 1;
        if n == 0 {
            break;
        } else if n & 0xc0 == 0xc0 {
            let low = *data.get(pos).context("truncated compression pointer")?;
            pos += 1;
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                anyhow::bail!("compression pointer loop");
            }
            if resume.is_none() {
                resume = Some(pos);
            }
            pos = (((n & 0x3f) as usize) << 8) | low as usize;
        } else if n & 0xc0 != 0 {
            anyhow::bail!("unsupported label type {:#x}", n);
        } else {
            let end = pos + n as usize;
            let label = data.get(pos..end).context("label runs past end of message")?;
            labels.push(String::from_utf8_lossy(label).into_owned());
            pos = end;
        }
    }
    cursor.set_position(resume.unwrap_or(pos) as u64);
    Ok(labels.join("."))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    /// `KEY=VALUE` entries; keys without a value map to ""
    Txt(BTreeMap<String, String>),
    Ptr(String),
    Other(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Record {
    pub name: String,
    pub typ: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub name: String,
    pub typ: u16,
    pub class: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsMessage {
    pub source: SocketAddr,
    pub transaction: u16,
    pub flags: u16,
    pub queries: Vec<Query>,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
}

impl DnsMessage {
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    /// Answers, authority and additional records in that order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.answers
            .iter()
            .chain(self.authority.iter())
            .chain(self.additional.iter())
    }
}

fn parse_txt(rdata: &[u8]) -> Result<BTreeMap<String, String>> {
    let mut cursor = Cursor::new(rdata);
    let mut out = BTreeMap::new();
    while (cursor.position() as usize) < rdata.len() {
        let len = cursor.read_u8()?;
        let mut buf = vec![0; len as usize];
        cursor.read_exact(&mut buf).context("truncated TXT entry")?;
        let entry = String::from_utf8_lossy(&buf);
        match entry.split_once('=') {
            Some((key, value)) => out.insert(key.to_owned(), value.to_owned()),
            None if !entry.is_empty() => out.insert(entry.into_owned(), String::new()),
            None => None,
        };
    }
    Ok(out)
}

fn parse_rdata(data: &[u8], typ: u16, start: usize, rdata: &[u8]) -> Result<RecordData> {
    Ok(match typ {
        TYPE_A => {
            let octets: [u8; 4] = rdata.try_into().context("A record is not correct")?;
            RecordData::A(Ipv4Addr::from(octets))
        }
        TYPE_AAAA => {
            let octets: [u8; 16] = rdata.try_into().context("AAAA record is not correct")?;
            RecordData::Aaaa(Ipv6Addr::from(octets))
        }
        TYPE_SRV => {
            // the target may point anywhere into the message
            let mut cursor = Cursor::new(data);
            cursor.set_position(start as u64);
            let priority = cursor.read_u16::<BigEndian>()?;
            let weight = cursor.read_u16::<BigEndian>()?;
            let port = cursor.read_u16::<BigEndian>()?;
            let target = read_name(data, &mut cursor).context("SRV target")?;
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            }
        }
        TYPE_PTR => {
            let mut cursor = Cursor::new(data);
            cursor.set_position(start as u64);
            RecordData::Ptr(read_name(data, &mut cursor).context("PTR target")?)
        }
        TYPE_TXT => RecordData::Txt(parse_txt(rdata)?),
        _ => RecordData::Other(rdata.to_vec()),
    })
}

fn parse_record(data: &[u8], cursor: &mut Cursor<&[u8]>) -> Result<Record> {
    let name = read_name(data, cursor)?;
    let typ = cursor.read_u16::<BigEndian>()?;
    let class = cursor.read_u16::<BigEndian>()?;
    let ttl = cursor.read_u32::<BigEndian>()?;
    let dlen = cursor.read_u16::<BigEndian>()? as usize;
    let start = cursor.position() as usize;
    let rdata = data
        .get(start..start + dlen)
        .context(format!("rdata of {} runs past end of message", name))?;
    let parsed = parse_rdata(data, typ, start, rdata).context(format!("record {}", name))?;
    cursor.set_position((start + dlen) as u64);

    Ok(Record {
        name,
        typ,
        class,
        ttl,
        data: parsed,
    })
}

fn parse_query(data: &[u8], cursor: &mut Cursor<&[u8]>) -> Result<Query> {
    let name = read_name(data, cursor)?;
    let typ = cursor.read_u16::<BigEndian>()?;
    let class = cursor.read_u16::<BigEndian>()?;

    Ok(Query { name, typ, class })
}

pub fn parse_dns(data: &[u8], source: SocketAddr) -> Result<DnsMessage> {
    let mut cursor = Cursor::new(data);
    let transaction = cursor.read_u16::<BigEndian>().context("dns header")?;
    let flags = cursor.read_u16::<BigEndian>().context("dns header")?;
    let nquestions = cursor.read_u16::<BigEndian>().context("dns header")?;
    let nanswers = cursor.read_u16::<BigEndian>().context("dns header")?;
    let nauthority = cursor.read_u16::<BigEndian>().context("dns header")?;
    let nadditional = cursor.read_u16::<BigEndian>().context("dns header")?;

    let mut queries = Vec::new();
    for _ in 0..nquestions {
        queries.push(parse_query(data, &mut cursor)?);
    }
    let mut sections = [Vec::new(), Vec::new(), Vec::new()];
    for (section, count) in sections.iter_mut().zip([nanswers, nauthority, nadditional]) {
        for _ in 0..count {
            section.push(parse_record(data, &mut cursor)?);
        }
    }
    let [answers, authority, additional] = sections;

    Ok(DnsMessage {
        source,
        transaction,
        flags,
        queries,
        answers,
        authority,
        additional,
    })
}
