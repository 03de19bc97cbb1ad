use std::io::{self, Read};
use std::iter::repeat_with;

use mio::net::UnixStream;

use crate::protocol::{self as fcgi, body, RecordHeader};


/// Uses [`fcgi::Role::Responder`] and full [`fcgi::RequestFlags`].
pub(super) fn add_begin(buf: &mut Vec<u8>, req_id: u16) {
    add_begin_role(buf, req_id, fcgi::Role::Responder);
}

pub(super) fn add_begin_role(buf: &mut Vec<u8>, req_id: u16, role: fcgi::Role) {
    buf.extend(body::BeginRequest { role, flags: fcgi::RequestFlags::all() }.to_record(req_id));
}

pub(super) fn add_abort(buf: &mut Vec<u8>, req_id: u16) {
    buf.extend(RecordHeader::new(fcgi::RecordType::AbortRequest, req_id).to_bytes());
}

pub(super) fn add_unk(buf: &mut Vec<u8>, req_id: u16, rtype: u8) {
    let rand_len = fastrand::u16(10..512);
    let mut head = [0; 8];
    head[0] = 1;
    head[1] = rtype;
    head[2..4].copy_from_slice(&req_id.to_be_bytes());
    head[4..6].copy_from_slice(&rand_len.to_be_bytes());
    buf.extend(head);
    buf.extend(repeat_with(|| fastrand::u8(..)).take(rand_len.into()));
}

/// Encodes `params` into PARAMS records with the payload sizes in `lens`,
/// splitting pairs across records where a size ends inside one. The last
/// size repeats as needed. Ends with the empty record.
pub(super) fn add_params(buf: &mut Vec<u8>, req_id: u16, params: &[(&[u8], &[u8])], lens: &[u16]) {
    let mut payload = Vec::new();
    for &nv in params {
        fcgi::nv::write(nv, &mut payload).unwrap();
    }
    add_stream(buf, req_id, fcgi::RecordType::Params, &payload, lens);
}

/// Encodes `data` into STDIN records like [`add_params`].
pub(super) fn add_stdin(buf: &mut Vec<u8>, req_id: u16, data: &[u8], lens: &[u16]) {
    add_stream(buf, req_id, fcgi::RecordType::Stdin, data, lens);
}

/// Encodes `data` into DATA records like [`add_params`].
pub(super) fn add_data(buf: &mut Vec<u8>, req_id: u16, data: &[u8], lens: &[u16]) {
    add_stream(buf, req_id, fcgi::RecordType::Data, data, lens);
}

fn add_stream(buf: &mut Vec<u8>, req_id: u16, rtype: fcgi::RecordType, mut data: &[u8], lens: &[u16]) {
    let mut head = RecordHeader::new(rtype, req_id);
    let mut recs = lens.iter().copied().chain(std::iter::repeat(*lens.last().unwrap_or(&u16::MAX)));
    while !data.is_empty() {
        let n = data.len().min(recs.next().unwrap_or(u16::MAX).max(1).into());
        head.content_length = n as u16;
        buf.extend(head.to_bytes());
        buf.extend(&data[..n]);
        data = &data[n..];
    }

    // Add the stream end header
    head.content_length = 0;
    buf.extend(head.to_bytes());
}

pub(super) fn randomize_padding(buf: &mut Vec<u8>) {
    let mut head_start = 0;
    while let Some(head) = buf.get_mut(head_start..(head_start + 8)) {
        let payload = u16::from_be_bytes([head[4], head[5]]);
        let old_pad = head[6];
        let new_pad = fastrand::u8(..);
        head[6] = new_pad;

        head_start += 8 + usize::from(payload);
        buf.splice(
            head_start..(head_start + usize::from(old_pad)),
            repeat_with(|| fastrand::u8(..)).take(new_pad.into()),
        );
        head_start += usize::from(new_pad);
    }
}

/// Splits raw output into records and their payloads.
pub(super) fn parse_records(mut data: &[u8]) -> Vec<(RecordHeader, Vec<u8>)> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let raw: [u8; 8] = data[..8].try_into().unwrap();
        let head = RecordHeader::from_bytes(raw).unwrap();
        let payload = data[8..][..usize::from(head.content_length)].to_vec();
        data = &data[(8 + head.body_len())..];
        out.push((head, payload));
    }
    out
}

/// Concatenates the STDOUT payloads.
pub(super) fn stdout(records: &[(RecordHeader, Vec<u8>)]) -> Vec<u8> {
    records.iter()
        .filter(|(h, _)| h.rtype == fcgi::RecordType::Stdout)
        .flat_map(|(_, p)| p.iter().copied())
        .collect()
}

pub(super) fn end_request(records: &[(RecordHeader, Vec<u8>)]) -> Option<(u16, body::EndRequest)> {
    records.iter()
        .find(|(h, _)| h.rtype == fcgi::RecordType::EndRequest)
        .map(|(h, p)| (h.request_id, body::EndRequest::from_bytes(p[..8].try_into().unwrap()).unwrap()))
}

/// Reads whatever the peer sent so far without blocking.
pub(super) fn read_available(stream: &mut UnixStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => panic!("read from driver failed: {e}"),
        }
    }
    out
}
