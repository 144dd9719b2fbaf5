use sha2::{Digest, Sha256, Sha512};

use crate::context::Context;
use crate::error::EvalError;
use crate::interpreter::Function;
use crate::value::Value;

use super::codec::hex;
use super::{function, string_arg};

pub fn functions() -> Vec<Function> {
    vec![
        function("digest.hash_sha256", 1, 1, hash_sha256),
        function("digest.hash_sha512", 1, 1, hash_sha512),
        function("digest.hmac_sha256", 2, 2, hmac_sha256),
        function("digest.hmac_sha256_base64", 2, 2, hmac_sha256_base64),
        function("digest.hmac_sha512", 2, 2, hmac_sha512),
        function("digest.hmac_sha512_base64", 2, 2, hmac_sha512_base64),
        function("digest.secure_is_equal", 2, 2, secure_is_equal),
    ]
}

pub fn sha256_hex(input: &[u8]) -> String {
    hex(&Sha256::digest(input))
}

/// RFC 2104 over any of the sha2 digests.
fn hmac<D: Digest>(block_size: usize, key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut key = if key.len() > block_size {
        D::digest(key).to_vec()
    } else {
        key.to_vec()
    };
    key.resize(block_size, 0);

    let inner_pad: Vec<u8> = key.iter().map(|b| b ^ 0x36).collect();
    let outer_pad: Vec<u8> = key.iter().map(|b| b ^ 0x5c).collect();

    let mut inner = D::new();
    inner.update(&inner_pad);
    inner.update(message);
    let inner = inner.finalize();

    let mut outer = D::new();
    outer.update(&outer_pad);
    outer.update(&inner);
    outer.finalize().to_vec()
}

fn hash_sha256(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::str(sha256_hex(string_arg(args, 0).as_bytes())))
}

fn hash_sha512(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::str(hex(&Sha512::digest(string_arg(args, 0).as_bytes()))))
}

fn hmac_sha256(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let mac = hmac::<Sha256>(64, string_arg(args, 0).as_bytes(), string_arg(args, 1).as_bytes());
    Ok(Value::str(hex(&mac)))
}

fn hmac_sha256_base64(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let mac = hmac::<Sha256>(64, string_arg(args, 0).as_bytes(), string_arg(args, 1).as_bytes());
    Ok(Value::str(base64::encode(mac)))
}

fn hmac_sha512(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let mac = hmac::<Sha512>(128, string_arg(args, 0).as_bytes(), string_arg(args, 1).as_bytes());
    Ok(Value::str(hex(&mac)))
}

fn hmac_sha512_base64(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let mac = hmac::<Sha512>(128, string_arg(args, 0).as_bytes(), string_arg(args, 1).as_bytes());
    Ok(Value::str(base64::encode(mac)))
}

/// Compares without short-circuiting on the first differing byte.
fn secure_is_equal(_: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
    let a = string_arg(args, 0);
    let b = string_arg(args, 1);
    if a.len() != b.len() {
        return Ok(Value::Bool(false));
    }
    let diff = a
        .bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    Ok(Value::Bool(diff == 0))
}
