use bytes::{BufMut, Bytes, BytesMut};
use http::{header::HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::common::error::SpdyError;

type Values = SmallVec<[Bytes; 1]>;

/// Decoded SPDY name/value block.
///
/// Keys keep their first-insertion order and every key may carry several
/// values, in the order they were received. Names are always lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    map: IndexMap<String, Values>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `name`, keeping earlier values.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        let mut name = name.into();
        name.make_ascii_lowercase();
        self.map.entry(name).or_default().push(value.into());
    }

    /// Replace every value of `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        let mut name = name.into();
        name.make_ascii_lowercase();
        let mut values = Values::new();
        values.push(value.into());
        self.map.insert(name, values);
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.map.get(name).and_then(|v| v.first())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn get_all(&self, name: &str) -> &[Bytes] {
        self.map.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Number of distinct names.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate `(name, value)` pairs; a multi-valued name yields one pair per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.map
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v)))
    }

    /// Fold a later block (e.g. a HEADERS frame) into this one.
    pub fn merge(&mut self, other: HeaderBlock) {
        for (name, values) in other.map {
            self.map.entry(name).or_default().extend(values);
        }
    }

    /// Size of the `encode_raw` output.
    pub fn encoded_len(&self) -> usize {
        4 + self
            .map
            .iter()
            .map(|(name, values)| {
                let value_len =
                    values.iter().map(|v| v.len()).sum::<usize>() + values.len().saturating_sub(1);
                8 + name.len() + value_len
            })
            .sum::<usize>()
    }

    /// Serialize to the uncompressed SPDY/3 layout: a 32 bit count, then
    /// length-prefixed names and NUL-joined, length-prefixed values.
    pub fn encode_raw(&self, dst: &mut BytesMut) {
        dst.put_u32(self.map.len() as u32);
        for (name, values) in self.map.iter() {
            dst.put_u32(name.len() as u32);
            dst.put_slice(name.as_bytes());
            let value_len =
                values.iter().map(|v| v.len()).sum::<usize>() + values.len().saturating_sub(1);
            dst.put_u32(value_len as u32);
            for (i, v) in values.iter().enumerate() {
                if i != 0 {
                    dst.put_u8(0);
                }
                dst.put_slice(v);
            }
        }
    }

    /// Build a request head from the SPDY/3 pseudo headers.
    pub fn to_request(&self) -> Result<Request<()>, SpdyError> {
        let method = self
            .get(":method")
            .ok_or(SpdyError::MissingHeader(":method"))?;
        let method = Method::from_bytes(method).map_err(http::Error::from)?;
        let path = self.get_str(":path").ok_or(SpdyError::MissingHeader(":path"))?;
        let uri = match (self.get_str(":scheme"), self.get_str(":host")) {
            (Some(scheme), Some(host)) => Uri::builder()
                .scheme(scheme)
                .authority(host)
                .path_and_query(path)
                .build()?,
            _ => path.parse::<Uri>().map_err(http::Error::from)?,
        };
        let version = parse_version(self.get(":version"))?;

        let mut builder = Request::builder().method(method).uri(uri).version(version);
        for (name, value) in self.regular_headers()? {
            builder = builder.header(name, value);
        }
        Ok(builder.body(())?)
    }

    /// Build a response head from the SPDY/3 pseudo headers.
    pub fn to_response(&self) -> Result<Response<()>, SpdyError> {
        let status = self
            .get(":status")
            .ok_or(SpdyError::MissingHeader(":status"))?;
        // ":status" carries the reason phrase too, e.g. "200 OK".
        let code = status.split(|b| *b == b' ').next().unwrap_or(&[]);
        let status = StatusCode::from_bytes(code).map_err(http::Error::from)?;
        let version = parse_version(self.get(":version"))?;

        let mut builder = Response::builder().status(status).version(version);
        for (name, value) in self.regular_headers()? {
            builder = builder.header(name, value);
        }
        Ok(builder.body(())?)
    }

    fn regular_headers(&self) -> Result<Vec<(HeaderName, HeaderValue)>, SpdyError> {
        self.iter()
            .filter(|(name, _)| !name.starts_with(':'))
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(http::Error::from)?;
                let value = HeaderValue::from_maybe_shared(value.clone())
                    .map_err(http::Error::from)?;
                Ok((name, value))
            })
            .collect()
    }
}

fn parse_version(v: Option<&Bytes>) -> Result<Version, SpdyError> {
    match v.map(|v| v.as_ref()) {
        None | Some(b"HTTP/1.1") => Ok(Version::HTTP_11),
        Some(b"HTTP/1.0") => Ok(Version::HTTP_10),
        Some(b"HTTP/0.9") => Ok(Version::HTTP_09),
        Some(_) => Err(SpdyError::protocol("unsupported :version")),
    }
}

impl<N, V> FromIterator<(N, V)> for HeaderBlock
where
    N: Into<String>,
    V: Into<Bytes>,
{
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut block = HeaderBlock::new();
        for (n, v) in iter {
            block.append(n, v);
        }
        block
    }
}
