use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Read},
    net::TcpStream,
};

use super::{HttpRequest, MAX_HTTP_BODY_BYTES};

/// Request path split into percent-decoded segments, plus query pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct RequestTarget {
    pub(super) segments: Vec<String>,
    pub(super) query: HashMap<String, String>,
}

impl RequestTarget {
    pub(super) fn parse(target: &str) -> Result<Self, String> {
        let (path, query_str) = target.split_once('?').unwrap_or((target, ""));
        let segments = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| percent_decode(segment, false))
            .collect::<Result<Vec<_>, _>>()?;
        let mut query = HashMap::new();
        for pair in query_str.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            query.insert(percent_decode(key, true)?, percent_decode(value, true)?);
        }
        Ok(Self { segments, query })
    }

    pub(super) fn segments(&self) -> Vec<&str> {
        self.segments.iter().map(String::as_str).collect()
    }

    pub(super) fn query_u64(&self, key: &str) -> Result<Option<u64>, String> {
        match self.query.get(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<u64>()
                .map(Some)
                .map_err(|_| format!("query parameter '{key}' must be a non-negative integer")),
        }
    }
}

/// `+` means a space only in query pairs (`plus_as_space`).
fn percent_decode(raw: &str, plus_as_space: bool) -> Result<String, String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'%' => {
                let (high, low) = match bytes.get(index + 1..index + 3) {
                    Some(&[high, low]) => (high, low),
                    _ => return Err(format!("truncated percent escape in '{raw}'")),
                };
                let value = hex_value(high)
                    .zip(hex_value(low))
                    .map(|(high, low)| high << 4 | low)
                    .ok_or_else(|| format!("invalid percent escape in '{raw}'"))?;
                out.push(value);
                index += 3;
            }
            b'+' if plus_as_space => {
                out.push(b' ');
                index += 1;
            }
            byte => {
                out.push(byte);
                index += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| format!("percent-decoded '{raw}' is not UTF-8"))
}

fn hex_value(digit: u8) -> Option<u8> {
    (digit as char).to_digit(16).map(|value| value as u8)
}

/// Reads one request from a socket; `Ok(None)` on a clean close.
pub(super) fn read_http_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>, String> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    let bytes = reader
        .read_line(&mut request_line)
        .map_err(|e| e.to_string())?;
    if bytes == 0 {
        return Ok(None);
    }
    let (method, target) = parse_request_line(&request_line)?;

    let mut headers = HashMap::new();
    loop {
        let mut header_line = String::new();
        let bytes = reader
            .read_line(&mut header_line)
            .map_err(|e| e.to_string())?;
        if bytes == 0 || header_line == "\r\n" {
            break;
        }
        insert_header(&mut headers, &header_line)?;
    }

    let content_length = declared_content_length(&headers)?;
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).map_err(|e| e.to_string())?;
    }

    Ok(Some(HttpRequest {
        method,
        target,
        headers,
        body,
    }))
}

/// Parses a complete request held in memory. The body must match the
/// declared content length exactly.
pub(super) fn parse_request_bytes(raw_request: &[u8]) -> Result<HttpRequest, String> {
    let terminator = raw_request
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| "missing HTTP header terminator".to_string())?;
    let header_block = std::str::from_utf8(&raw_request[..terminator])
        .map_err(|_| "request headers must be valid UTF-8".to_string())?;
    let body = &raw_request[terminator + 4..];

    let mut lines = header_block.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| "missing request line".to_string())?;
    let (method, target) = parse_request_line(request_line)?;

    let mut headers = HashMap::new();
    for line in lines.filter(|line| !line.trim().is_empty()) {
        insert_header(&mut headers, line)?;
    }

    if declared_content_length(&headers)? != body.len() {
        return Err("content-length does not match body size".to_string());
    }

    Ok(HttpRequest {
        method,
        target,
        headers,
        body: body.to_vec(),
    })
}

fn insert_header(headers: &mut HashMap<String, String>, line: &str) -> Result<(), String> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| "invalid HTTP header".to_string())?;
    headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    Ok(())
}

fn declared_content_length(headers: &HashMap<String, String>) -> Result<usize, String> {
    let content_length = match headers.get("content-length") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| "invalid content-length header".to_string())?,
        None => 0,
    };
    if content_length > MAX_HTTP_BODY_BYTES {
        return Err(format!(
            "content-length exceeds max body size ({MAX_HTTP_BODY_BYTES} bytes)"
        ));
    }
    Ok(content_length)
}

fn parse_request_line(line: &str) -> Result<(String, String), String> {
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| "missing HTTP method".to_string())?;
    let target = parts
        .next()
        .ok_or_else(|| "missing HTTP target".to_string())?;
    let version = parts
        .next()
        .ok_or_else(|| "missing HTTP version".to_string())?;
    if !version.starts_with("HTTP/1.") {
        return Err("unsupported HTTP version".to_string());
    }
    Ok((method.to_string(), target.to_string()))
}
