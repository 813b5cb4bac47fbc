#![no_main]

use libfuzzer_sys::fuzz_target;
use netque::utils::compression::{compress, decompress, CompressionKind};

const KINDS: [CompressionKind; 4] = [
    CompressionKind::Zlib,
    CompressionKind::Gzip,
    CompressionKind::Lz4,
    CompressionKind::Zstd,
];

fuzz_target!(|data: &[u8]| {
    for kind in &KINDS {
        // Round trip must hold for anything under the size cap
        if let Ok(compressed) = compress(data, kind) {
            if let Ok(out) = decompress(&compressed, kind) {
                assert_eq!(out, data);
            }
        }

        // Malformed input must error, not panic or allocate without bound
        let _ = decompress(data, kind);
    }
});
