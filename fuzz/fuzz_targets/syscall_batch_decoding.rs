#![no_main]
use libfuzzer_sys::fuzz_target;
use void_wasm_exec::module::ipc::protocol::{decode_batch, encode_batch, SyscallResponse};

fuzz_target!(|data: &[u8]| {
    // Guest memory is untrusted: decoding must never panic, and every
    // non-blank line yields exactly one decode result.
    let lines = data
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .count();
    let decoded = decode_batch(data);
    assert!(decoded.len() <= lines);

    let responses: Vec<SyscallResponse> = decoded
        .iter()
        .map(|result| match result {
            Ok(request) => SyscallResponse::success(request),
            Err(_) => SyscallResponse::error(None, "malformed_request"),
        })
        .collect();
    let encoded = encode_batch(&responses);
    assert_eq!(
        encoded.iter().filter(|b| **b == b'\n').count(),
        responses.len()
    );
});
