#![no_main]
use libfuzzer_sys::fuzz_target;
use void_wasm_exec::module::traits::EntrySignature;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    // Anything that parses must render back to an equivalent signature
    if let Ok(signature) = text.parse::<EntrySignature>() {
        let rendered = signature.to_string();
        let reparsed: EntrySignature = rendered.parse().expect("rendered signature parses");
        assert_eq!(reparsed, signature);
    }
});
