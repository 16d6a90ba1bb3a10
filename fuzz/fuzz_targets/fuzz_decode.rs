#![no_main]

//! Arbitrary text through the JSON-string decoder and a nested decoder
//! built from arbitrary field names. Decoding must fail with an error,
//! never panic, and every error must render.

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use vela_json::decode;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    text: &'a str,
    path: Vec<&'a str>,
    index: u8,
}

fuzz_target!(|input: Input<'_>| {
    let leaf = decode::one_of(vec![
        decode::map(decode::string(), |s| s.len() as i64),
        decode::int(),
        decode::map(decode::list(decode::value()), |items| items.len() as i64),
        decode::null(0),
    ]);
    let path: Vec<&str> = input.path.iter().take(8).copied().collect();
    let nested = decode::at(&path, decode::index(usize::from(input.index), leaf.clone()));
    let loose = decode::maybe(decode::field("x", leaf));

    for decoder in [&nested, &loose] {
        if let Err(err) = decode::decode_str(decoder, input.text) {
            let _ = err.to_string();
        }
    }
});
