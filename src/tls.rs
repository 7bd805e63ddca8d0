use bytes::{BufMut, Bytes, BytesMut};

use crate::cursor::Cursor;
use crate::error::{EncodeError, ParseError};

pub const TLS_HANDSHAKE: u8 = 0x16;
pub const CLIENT_HELLO: u8 = 0x01;
/// Record version written on every serialized record, whatever the client sent.
pub const TLS_VERSION_1_2: [u8; 2] = [0x03, 0x03];
pub const RECORD_HEADER_LEN: usize = 5;
/// Declared record lengths above this are treated as "not a ClientHello".
pub const MAX_RECORD_LEN: usize = 64 * 1024;

pub const EXT_SERVER_NAME: u16 = 0x0000;
pub const EXT_PADDING: u16 = 0x0015;
pub const EXT_PRE_SHARED_KEY: u16 = 0x0029;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Extension payloads keyed by type, iterated in a stable order: wire order
/// for parsed extensions, appended for new ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    entries: Vec<(u16, Vec<u8>)>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, ext_type: u16) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(t, _)| *t == ext_type)
            .map(|(_, data)| data.as_slice())
    }

    pub fn contains(&self, ext_type: u16) -> bool {
        self.get(ext_type).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &[u8])> {
        self.entries.iter().map(|(t, data)| (*t, data.as_slice()))
    }

    pub fn types(&self) -> Vec<u16> {
        self.entries.iter().map(|(t, _)| *t).collect()
    }

    /// Overwrites in place if the type is present. A new type is appended,
    /// but never after `pre_shared_key`, which TLS 1.3 requires to be last.
    pub fn insert(&mut self, ext_type: u16, data: Vec<u8>) -> Option<Vec<u8>> {
        if let Some(slot) = self.entries.iter_mut().find(|(t, _)| *t == ext_type) {
            return Some(std::mem::replace(&mut slot.1, data));
        }
        match self.entries.last() {
            Some((EXT_PRE_SHARED_KEY, _)) if ext_type != EXT_PRE_SHARED_KEY => {
                let at = self.entries.len() - 1;
                self.entries.insert(at, (ext_type, data));
            }
            _ => self.entries.push((ext_type, data)),
        }
        None
    }

    pub fn remove(&mut self, ext_type: u16) -> Option<Vec<u8>> {
        let idx = self.entries.iter().position(|(t, _)| *t == ext_type)?;
        Some(self.entries.remove(idx).1)
    }

    // Parsing keeps wire order exactly, including a misplaced pre_shared_key.
    fn push_parsed(&mut self, ext_type: u16, data: Vec<u8>) {
        match self.entries.iter_mut().find(|(t, _)| *t == ext_type) {
            Some(slot) => slot.1 = data,
            None => self.entries.push((ext_type, data)),
        }
    }

    fn encoded_len(&self) -> usize {
        self.entries.iter().map(|(_, data)| 4 + data.len()).sum()
    }

    fn encode_into(&self, out: &mut BytesMut) -> Result<(), EncodeError> {
        for (ext_type, data) in &self.entries {
            out.put_u16(*ext_type);
            out.put_u16(checked_u16(data.len(), "extension payload")?);
            out.put_slice(data);
        }
        Ok(())
    }
}

/// Decoded ClientHello handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub protocol_version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    extensions: Extensions,
    server_name: String,
}

impl ClientHello {
    pub fn new(protocol_version: u16, random: [u8; 32], session_id: Vec<u8>, cipher_suites: Vec<u16>) -> Self {
        Self {
            protocol_version,
            random,
            session_id,
            cipher_suites,
            extensions: Extensions::new(),
            server_name: String::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Self::parse_record(data, MAX_RECORD_LEN).map(|(hello, _)| hello)
    }

    /// Decodes the first record in `data`. Returns the hello and the number of
    /// bytes the record occupied; anything after that belongs to the caller.
    pub fn parse_record(data: &[u8], max_record_len: usize) -> Result<(Self, usize), ParseError> {
        let content_type = *data.first().ok_or(ParseError::Incomplete)?;
        if content_type != TLS_HANDSHAKE {
            return Err(ParseError::NotHandshakeRecord(content_type));
        }
        if data.len() < RECORD_HEADER_LEN {
            return Err(ParseError::Incomplete);
        }

        let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
        if record_len > max_record_len {
            return Err(ParseError::RecordTooLarge {
                len: record_len,
                max: max_record_len,
            });
        }
        // the handshake type is known long before the body is complete
        if let Some(&handshake_type) = data.get(RECORD_HEADER_LEN) {
            if handshake_type != CLIENT_HELLO {
                return Err(ParseError::NotClientHello(handshake_type));
            }
        }
        let total = RECORD_HEADER_LEN + record_len;
        if data.len() < total {
            return Err(ParseError::Incomplete);
        }

        let mut record = Cursor::new(&data[RECORD_HEADER_LEN..total]);
        record.read_u8("handshake type")?;
        let handshake_len = record.read_u24("handshake length")? as usize;
        let mut body = record.sub(handshake_len, "handshake body")?;

        Ok((Self::parse_body(&mut body)?, total))
    }

    fn parse_body(body: &mut Cursor<'_>) -> Result<Self, ParseError> {
        let protocol_version = body.read_u16("client version")?;
        let random = body.read_array::<32>("random")?;
        let session_id = body.read_vec_u8("session id")?.to_vec();

        let suites = body.read_vec_u16("cipher suites")?;
        if suites.len() % 2 != 0 {
            return Err(ParseError::Malformed("odd cipher suite list length"));
        }
        let cipher_suites = suites
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();

        // compression is always re-emitted as a single null method
        body.read_vec_u8("compression methods")?;

        let mut hello = Self::new(protocol_version, random, session_id, cipher_suites);
        if body.is_empty() {
            return Ok(hello);
        }

        let block_len = body.read_u16("extensions length")? as usize;
        let mut block = body.sub(block_len, "extensions")?;
        while !block.is_empty() {
            let ext_type = block.read_u16("extension type")?;
            let data = block.read_vec_u16("extension payload")?;
            if ext_type == EXT_SERVER_NAME {
                hello.server_name = parse_host_name(data)?.unwrap_or_default();
            }
            hello.extensions.push_parsed(ext_type, data.to_vec());
        }

        Ok(hello)
    }

    pub fn serialize(&self) -> Result<Bytes, EncodeError> {
        if self.session_id.len() > u8::MAX as usize {
            return Err(EncodeError::SessionIdTooLong(self.session_id.len()));
        }

        let suites_len = checked_u16(self.cipher_suites.len() * 2, "cipher suites")?;
        let extensions_len = checked_u16(self.extensions.encoded_len(), "extensions")?;

        let mut body = BytesMut::with_capacity(
            2 + 32 + 1 + self.session_id.len() + 2 + suites_len as usize + 2 + 2 + extensions_len as usize,
        );
        body.put_u16(self.protocol_version);
        body.put_slice(&self.random);
        body.put_u8(self.session_id.len() as u8);
        body.put_slice(&self.session_id);

        body.put_u16(suites_len);
        for suite in &self.cipher_suites {
            body.put_u16(*suite);
        }

        body.put_u8(1); // one compression method
        body.put_u8(0); // null

        body.put_u16(extensions_len);
        self.extensions.encode_into(&mut body)?;

        let record_len = checked_u16(4 + body.len(), "record")?;

        let mut out = BytesMut::with_capacity(RECORD_HEADER_LEN + record_len as usize);
        out.put_u8(TLS_HANDSHAKE);
        out.put_slice(&TLS_VERSION_1_2);
        out.put_u16(record_len);
        out.put_u8(CLIENT_HELLO);
        out.put_uint(body.len() as u64, 3);
        out.put_slice(&body);

        Ok(out.freeze())
    }

    /// Host name from the SNI extension, empty if there is none.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Sets an extension payload, keeping the cached server name in step when
    /// the SNI extension is the one replaced.
    pub fn set_extension(&mut self, ext_type: u16, data: Vec<u8>) -> Result<(), ParseError> {
        if ext_type == EXT_SERVER_NAME {
            self.server_name = parse_host_name(&data)?.unwrap_or_default();
        }
        self.extensions.insert(ext_type, data);
        Ok(())
    }

    pub fn remove_extension(&mut self, ext_type: u16) -> Option<Vec<u8>> {
        if ext_type == EXT_SERVER_NAME {
            self.server_name.clear();
        }
        self.extensions.remove(ext_type)
    }

    pub fn remove_sni(&mut self) {
        self.remove_extension(EXT_SERVER_NAME);
    }

    pub fn add_padding(&mut self, size: u16) {
        self.extensions.insert(EXT_PADDING, vec![0u8; size as usize]);
    }
}

fn parse_host_name(data: &[u8]) -> Result<Option<String>, ParseError> {
    let mut ext = Cursor::new(data);
    let list_len = ext.read_u16("server name list length")? as usize;
    let mut list = ext.sub(list_len, "server name list")?;
    if list.read_u8("server name type")? != NAME_TYPE_HOST_NAME {
        return Ok(None);
    }
    let name = list.read_vec_u16("host name")?;
    std::str::from_utf8(name)
        .map(|s| Some(s.to_string()))
        .map_err(|_| ParseError::Malformed("host name is not UTF-8"))
}

fn checked_u16(len: usize, field: &'static str) -> Result<u16, EncodeError> {
    u16::try_from(len).map_err(|_| EncodeError::LengthOverflow { field, len })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_random() -> [u8; 32] {
        let mut random = [0u8; 32];
        for (i, b) in random.iter_mut().enumerate() {
            *b = i as u8;
        }
        random
    }

    /// SNI extension payload with a single host_name entry.
    pub(crate) fn sni_extension(host: &str) -> Vec<u8> {
        let len = checked_u16(host.len(), "host name").unwrap();
        let mut sni = BytesMut::with_capacity(host.len() + 5);
        sni.put_u16(len + 3);
        sni.put_u8(NAME_TYPE_HOST_NAME);
        sni.put_u16(len);
        sni.put_slice(host.as_bytes());
        sni.to_vec()
    }

    pub(crate) fn sample_hello(host: &str) -> ClientHello {
        let mut hello = ClientHello::new(0x0303, sample_random(), vec![0xab; 32], vec![0x1301, 0x1302, 0xc02f]);
        hello.set_extension(EXT_SERVER_NAME, sni_extension(host)).unwrap();
        hello.set_extension(0x000a, vec![0x00, 0x02, 0x00, 0x1d]).unwrap();
        hello.set_extension(0x002b, vec![0x04, 0x03, 0x04, 0x03, 0x03]).unwrap();
        hello
    }

    /// ClientHello with SNI "ex", record version 0x0301.
    fn example_record() -> Vec<u8> {
        let mut v = vec![0x16, 0x03, 0x01, 0x00, 0x3a, 0x01, 0x00, 0x00, 0x36, 0x03, 0x03];
        v.extend_from_slice(&sample_random());
        v.extend_from_slice(&[0x00, 0x00, 0x02, 0x00, 0x2f, 0x01, 0x00]);
        v.extend_from_slice(&[0x00, 0x0b, 0x00, 0x00, 0x00, 0x07, 0x00, 0x05, 0x00, 0x00, 0x02, 0x65, 0x78]);
        v
    }

    #[test]
    fn test_parse_example() {
        let hello = ClientHello::parse(&example_record()).unwrap();
        assert_eq!(hello.server_name(), "ex");
        assert_eq!(hello.protocol_version, 0x0303);
        assert_eq!(hello.random, sample_random());
        assert!(hello.session_id.is_empty());
        assert_eq!(hello.cipher_suites, vec![0x002f]);
        assert_eq!(hello.extensions().types(), vec![EXT_SERVER_NAME]);
    }

    #[test]
    fn test_example_rewrite_end_to_end() {
        let mut hello = ClientHello::parse(&example_record()).unwrap();
        hello.remove_sni();
        hello.add_padding(256);
        let out = hello.serialize().unwrap();

        assert_eq!(&out[..3], &[0x16, 0x03, 0x03]);
        let reparsed = ClientHello::parse(&out).unwrap();
        assert_eq!(reparsed.server_name(), "");
        assert_eq!(reparsed.extensions().len(), 1);
        assert_eq!(reparsed.extensions().get(EXT_PADDING), Some(&[0u8; 256][..]));
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let mut hello = sample_hello("www.example.com");
        hello.set_extension(0xfe0d, vec![7; 300]).unwrap();
        let first = hello.serialize().unwrap();
        let second = ClientHello::parse(&first).unwrap().serialize().unwrap();
        assert_eq!(first, second);
        assert_eq!(ClientHello::parse(&first).unwrap(), hello);
    }

    #[test]
    fn test_serialized_lengths_are_consistent() {
        let mut hello = sample_hello("a.example");
        hello.add_padding(100);
        let out = hello.serialize().unwrap();

        let record_len = u16::from_be_bytes([out[3], out[4]]) as usize;
        assert_eq!(record_len, out.len() - 5);

        let handshake_len = u32::from_be_bytes([0, out[6], out[7], out[8]]) as usize;
        assert_eq!(handshake_len, out.len() - 9);

        // 9 header bytes, version, random, session id, suites, compression
        let ext_at = 9 + 2 + 32 + 1 + 32 + 2 + 6 + 2;
        let ext_len = u16::from_be_bytes([out[ext_at], out[ext_at + 1]]) as usize;
        let expected: usize = hello.extensions().iter().map(|(_, d)| 4 + d.len()).sum();
        assert_eq!(ext_len, expected);
        assert_eq!(ext_at + 2 + ext_len, out.len());
    }

    #[test]
    fn test_empty_extensions_still_emit_length() {
        let hello = ClientHello::new(0x0303, sample_random(), vec![], vec![0x1301]);
        let out = hello.serialize().unwrap();
        assert_eq!(&out[out.len() - 4..], &[0x01, 0x00, 0x00, 0x00]);
        assert!(ClientHello::parse(&out).unwrap().extensions().is_empty());
    }

    #[test]
    fn test_every_prefix_is_incomplete_or_truncated() {
        let out = sample_hello("prefix.example").serialize().unwrap();
        for n in 0..out.len() {
            match ClientHello::parse(&out[..n]) {
                Err(ParseError::Incomplete) | Err(ParseError::Truncated { .. }) => {}
                other => panic!("prefix of {} bytes gave {:?}", n, other),
            }
        }
    }

    #[test]
    fn test_inner_lengths_are_bounds_checked() {
        let mut out = sample_hello("x.example").serialize().unwrap().to_vec();
        // claim a longer handshake than the record holds
        out[8] = out[8].wrapping_add(1);
        assert!(matches!(ClientHello::parse(&out), Err(ParseError::Truncated { .. })));

        let mut out = sample_hello("x.example").serialize().unwrap().to_vec();
        // session id length beyond the body
        out[9 + 34] = 0xff;
        assert!(matches!(ClientHello::parse(&out), Err(ParseError::Truncated { .. })));
    }

    #[test]
    fn test_classifies_foreign_records() {
        let mut out = sample_hello("x.example").serialize().unwrap().to_vec();
        assert_eq!(ClientHello::parse(b"GET / HTTP/1.1\r\n"), Err(ParseError::NotHandshakeRecord(b'G')));

        out[5] = 0x02;
        assert_eq!(ClientHello::parse(&out), Err(ParseError::NotClientHello(0x02)));
        // a partial ServerHello is classified without waiting for the rest
        assert_eq!(ClientHello::parse(&out[..6]), Err(ParseError::NotClientHello(0x02)));
        assert_eq!(ClientHello::parse(&out[..5]), Err(ParseError::Incomplete));

        let out = sample_hello("x.example").serialize().unwrap();
        let err = ClientHello::parse_record(&out, 64).unwrap_err();
        assert!(matches!(err, ParseError::RecordTooLarge { max: 64, .. }));
        assert!(err.is_foreign_traffic());
    }

    #[test]
    fn test_odd_cipher_suite_length_is_malformed() {
        let mut v = vec![0x16, 0x03, 0x01, 0x00, 0x2c, 0x01, 0x00, 0x00, 0x28, 0x03, 0x03];
        v.extend_from_slice(&sample_random());
        v.extend_from_slice(&[0x00, 0x00, 0x01, 0x2f, 0x01, 0x00]);
        assert_eq!(ClientHello::parse(&v), Err(ParseError::Malformed("odd cipher suite list length")));
    }

    #[test]
    fn test_missing_extension_block_parses() {
        let hello = ClientHello::new(0x0303, sample_random(), vec![1, 2, 3], vec![0x1301]);
        let mut out = hello.serialize().unwrap().to_vec();
        out.truncate(out.len() - 2);
        // patch lengths for the dropped extensions length field
        let record_len = (out.len() - 5) as u16;
        out[3..5].copy_from_slice(&record_len.to_be_bytes());
        out[8] -= 2;
        let parsed = ClientHello::parse(&out).unwrap();
        assert!(parsed.extensions().is_empty());
        assert_eq!(parsed.session_id, vec![1, 2, 3]);
    }

    #[test]
    fn test_trailing_bytes_are_left_to_caller() {
        let mut data = sample_hello("x.example").serialize().unwrap().to_vec();
        let record_len = data.len();
        data.extend_from_slice(&[0x14, 0x03, 0x03, 0x00, 0x01, 0x01]);
        let (hello, used) = ClientHello::parse_record(&data, MAX_RECORD_LEN).unwrap();
        assert_eq!(used, record_len);
        assert_eq!(hello.server_name(), "x.example");
    }

    #[test]
    fn test_non_hostname_sni_is_kept_opaque() {
        let mut hello = ClientHello::new(0x0303, sample_random(), vec![], vec![0x1301]);
        let sni = vec![0x00, 0x04, 0x07, 0x00, 0x01, b'z'];
        hello.set_extension(EXT_SERVER_NAME, sni.clone()).unwrap();
        let parsed = ClientHello::parse(&hello.serialize().unwrap()).unwrap();
        assert_eq!(parsed.server_name(), "");
        assert_eq!(parsed.extensions().get(EXT_SERVER_NAME), Some(sni.as_slice()));
    }

    #[test]
    fn test_new_extensions_stay_before_pre_shared_key() {
        let mut hello = sample_hello("x.example");
        hello.set_extension(EXT_PRE_SHARED_KEY, vec![0; 8]).unwrap();
        hello.add_padding(16);
        let types = hello.extensions().types();
        assert_eq!(types.last(), Some(&EXT_PRE_SHARED_KEY));
        assert_eq!(types[types.len() - 2], EXT_PADDING);
    }

    #[test]
    fn test_oversized_session_id_is_rejected() {
        let hello = ClientHello::new(0x0303, sample_random(), vec![0; 256], vec![]);
        assert_eq!(hello.serialize(), Err(EncodeError::SessionIdTooLong(256)));
    }
}
