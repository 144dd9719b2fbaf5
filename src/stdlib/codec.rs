use crate::context::Context;
use crate::error::EvalError;
use crate::interpreter::Function;
use crate::value::Value;

use super::{function, string_arg};

pub fn functions() -> Vec<Function> {
    vec![
        function("digest.base64", 1, 1, base64_encode),
        function("digest.base64_decode", 1, 1, base64_decode),
        function("digest.base64url", 1, 1, base64url),
        function("digest.base64url_decode", 1, 1, base64url_decode),
        function("digest.base64url_nopad", 1, 1, base64url_nopad),
        function("digest.base64url_nopad_decode", 1, 1, base64url_nopad_decode),
        function("bin.base64_to_hex", 1, 1, base64_to_hex),
        function("bin.hex_to_base64", 1, 1, hex_to_base64),
        function("urlencode", 1, 1, urlencode),
        function("urldecode", 1, 1, urldecode),
        function("utf8.is_valid", 1, 1, utf8_is_valid),
    ]
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn unhex(text: &str) -> Option<Vec<u8>> {
    let text = text.trim();
    let text = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| text.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

/// Undecodable input becomes "" rather than an error.
fn decoded(input: &str, config: base64::Config) -> Value {
    match base64::decode_config(input.trim(), config) {
        Ok(bytes) => Value::str(String::from_utf8_lossy(&bytes).into_owned()),
        Err(_) => Value::str(""),
    }
}

fn base64_encode(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::str(base64::encode(string_arg(args, 0))))
}

fn base64_decode(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(decoded(&string_arg(args, 0), base64::STANDARD))
}

fn base64url(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::str(base64::encode_config(string_arg(args, 0), base64::URL_SAFE)))
}

fn base64url_decode(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(decoded(&string_arg(args, 0), base64::URL_SAFE))
}

fn base64url_nopad(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::str(base64::encode_config(
        string_arg(args, 0),
        base64::URL_SAFE_NO_PAD,
    )))
}

fn base64url_nopad_decode(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(decoded(&string_arg(args, 0), base64::URL_SAFE_NO_PAD))
}

fn base64_to_hex(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(match base64::decode(string_arg(args, 0).trim()) {
        Ok(bytes) => Value::str(hex(&bytes)),
        Err(_) => Value::str(""),
    })
}

fn hex_to_base64(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(match unhex(&string_arg(args, 0)) {
        Some(bytes) => Value::str(base64::encode(bytes)),
        None => Value::str(""),
    })
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~')
}

pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Malformed escapes are kept as-is.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let byte = input
                .get(i + 1..i + 3)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok());
            if let Some(byte) = byte {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn urlencode(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::str(percent_encode(&string_arg(args, 0))))
}

fn urldecode(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::str(percent_decode(&string_arg(args, 0))))
}

/// Request bytes are decoded lossily, so invalid input shows up as U+FFFD.
fn utf8_is_valid(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(!string_arg(args, 0).contains('\u{FFFD}')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdlib::tests::{call, ctx};

    fn s(v: &str) -> Value {
        Value::str(v)
    }

    #[test]
    fn test_base64() {
        let mut ctx = ctx();
        assert_eq!(call(&mut ctx, "digest.base64", &[s("hello")]), s("aGVsbG8="));
        assert_eq!(call(&mut ctx, "digest.base64_decode", &[s("aGVsbG8=")]), s("hello"));
        assert_eq!(call(&mut ctx, "digest.base64_decode", &[s("!!!")]), s(""));
        assert_eq!(call(&mut ctx, "digest.base64url_nopad", &[s("hi?")]), s("aGk_"));
        assert_eq!(call(&mut ctx, "digest.base64url_nopad_decode", &[s("aGk_")]), s("hi?"));
    }

    #[test]
    fn test_hex() {
        let mut ctx = ctx();
        assert_eq!(call(&mut ctx, "bin.base64_to_hex", &[s("AAEC")]), s("000102"));
        assert_eq!(call(&mut ctx, "bin.hex_to_base64", &[s("0x000102")]), s("AAEC"));
        assert_eq!(call(&mut ctx, "bin.hex_to_base64", &[s("abc")]), s(""));
    }

    #[test]
    fn test_urlencode() {
        let mut ctx = ctx();
        assert_eq!(call(&mut ctx, "urlencode", &[s("a b/c")]), s("a%20b%2Fc"));
        assert_eq!(call(&mut ctx, "urldecode", &[s("a%20b%2fc")]), s("a b/c"));
        assert_eq!(call(&mut ctx, "urldecode", &[s("100%")]), s("100%"));
        assert_eq!(call(&mut ctx, "utf8.is_valid", &[s("ok")]), Value::Bool(true));
    }
}
