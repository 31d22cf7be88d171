#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use taglog_core::{CommitBatchBuilder, CommitBatchReader, ExecOp, PeekBodyReader, Tag};

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary bytes to the batch and peek-body decoders. They must
    // reject malformed input without panicking:
    // - truncated length prefixes and tag lists
    // - lengths smaller than the fixed header
    // - version headers in the wrong place
    let bytes = Bytes::copy_from_slice(data);
    for message in CommitBatchReader::new(bytes.clone()) {
        if message.is_err() {
            break;
        }
    }
    for entry in PeekBodyReader::new(bytes) {
        if entry.is_err() {
            break;
        }
    }
    let _ = ExecOp::decode(data);

    // Round-trip a batch built from the input so the encoder and decoder
    // stay in agreement.
    if data.len() >= 4 {
        let locality = data[0] as i8;
        let id = u16::from_le_bytes([data[1], data[2]]);
        let mut builder = CommitBatchBuilder::new();
        builder.append(&[Tag::new(locality, id)], &data[3..]);
        let batch = builder.finish();
        let decoded: Vec<_> = CommitBatchReader::new(batch)
            .collect::<Result<_, _>>()
            .expect("encoder output must decode");
        assert_eq!(decoded.len(), 1);
        assert_eq!(&decoded[0].payload[..], &data[3..]);
    }
});
