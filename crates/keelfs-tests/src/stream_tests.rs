//! Codec integration tests: each codec alone and composed through `OutStream`/`InStream`.

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read, Seek, SeekFrom, Write};

    use keelfs_stream::compression;
    use keelfs_stream::encryption::{self, FLAG_AES_GCM, FLAG_CHACHA20_POLY1305};
    use keelfs_stream::{
        pack, unpack, BufferPool, CipherAlgorithm, CompressionAlgorithm, ErrorClass, Hint,
        InStream, OutStream, StreamConfig, StreamError,
    };
    use proptest::prelude::*;

    use crate::harness::{init_tracing, random_bytes, test_key, text_bytes};

    fn read_from<R: Read + Seek>(reader: &mut R, offset: u64) -> Vec<u8> {
        reader.seek(SeekFrom::Start(offset)).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_encrypt_200k_seek_150k() {
        init_tracing();
        let data = random_bytes(200_000, 42);
        let key = test_key(1);
        let mut writer = encryption::Writer::new(Vec::new(), &key, FLAG_AES_GCM).unwrap();
        writer.write_all(&data).unwrap();
        let blob = writer.finish().unwrap();

        let mut reader = encryption::Reader::new(Cursor::new(blob), &key).unwrap();
        assert_eq!(read_from(&mut reader, 150_000), &data[150_000..]);
    }

    #[test]
    fn test_ciphertext_is_deterministic() {
        let data = random_bytes(100_000, 7);
        let key = test_key(2);
        for flags in [FLAG_AES_GCM, FLAG_CHACHA20_POLY1305] {
            let once = {
                let mut w = encryption::Writer::new(Vec::new(), &key, flags).unwrap();
                w.write_all(&data).unwrap();
                w.finish().unwrap()
            };
            let twice = {
                let mut w = encryption::Writer::new(Vec::new(), &key, flags).unwrap();
                w.write_all(&data).unwrap();
                w.finish().unwrap()
            };
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_tampered_block_is_integrity_error() {
        let key = test_key(3);
        let mut blob = pack(&random_bytes(10_000, 3), &key, Hint::default()).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let err = unpack(&blob, &key).unwrap_err();
        assert!(matches!(err, StreamError::DecryptionAuthFailed { .. }));
        assert_eq!(err.kind(), ErrorClass::Integrity);
    }

    #[test]
    fn test_tampered_compressed_blob_keeps_integrity_class() {
        let key = test_key(3);
        let hint = Hint {
            cipher: CipherAlgorithm::AesGcm256,
            compression: CompressionAlgorithm::Lz4,
        };
        let mut blob = pack(&text_bytes(10_000), &key, hint).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;

        let err = unpack(&blob, &key).unwrap_err();
        assert_eq!(err.kind(), ErrorClass::Integrity);

        let mut input = InStream::new(Cursor::new(blob), &key).unwrap();
        let err = input.plaintext_len().unwrap_err();
        assert!(matches!(err, StreamError::DecryptionAuthFailed { .. }));
        assert_eq!(err.kind(), ErrorClass::Integrity);
    }

    #[test]
    fn test_compression_inside_encryption_by_hand() {
        let data = text_bytes(300_000);
        let key = test_key(4);
        let flags = FLAG_CHACHA20_POLY1305 | encryption::FLAG_COMPRESSED;
        let enc = encryption::Writer::new(Vec::new(), &key, flags).unwrap();
        let mut zip = compression::Writer::new(enc, CompressionAlgorithm::Snappy).unwrap();
        zip.write_all(&data).unwrap();
        let blob = zip.finish().unwrap().finish().unwrap();

        let mut input = InStream::new(Cursor::new(blob), &key).unwrap();
        assert!(matches!(input, InStream::Compressed(_)));
        assert_eq!(input.plaintext_len().unwrap(), data.len() as u64);
        assert_eq!(read_from(&mut input, 123_456), &data[123_456..]);
    }

    #[test]
    fn test_hint_drives_layout() {
        let key = test_key(5);
        let text = text_bytes(50_000);
        let noise = random_bytes(50_000, 5);

        let text_hint = Hint::for_path("docs/readme.md", &text);
        assert_eq!(text_hint.compression, CompressionAlgorithm::Zstd { level: 3 });
        let noise_hint = Hint::for_path("blob.bin", &noise);
        assert_eq!(noise_hint.compression, CompressionAlgorithm::None);

        let text_blob = pack(&text, &key, text_hint).unwrap();
        let noise_blob = pack(&noise, &key, noise_hint).unwrap();
        assert!(text_blob.len() < text.len() / 4);
        assert_eq!(
            noise_blob.len() as u64,
            encryption::encrypted_size(noise.len() as u64, encryption::DEFAULT_BLOCK_SIZE)
        );
        assert_eq!(unpack(&text_blob, &key).unwrap(), text);
        assert_eq!(unpack(&noise_blob, &key).unwrap(), noise);
    }

    #[test]
    fn test_shared_pool_is_reused() {
        let pool = BufferPool::default();
        let key = test_key(6);
        let hint = Hint {
            cipher: CipherAlgorithm::AesGcm256,
            compression: CompressionAlgorithm::Lz4,
        };
        for round in 0..4 {
            let data = text_bytes(80_000 + round);
            let mut out =
                OutStream::with_options(Vec::new(), &key, hint, StreamConfig::default(), &pool)
                    .unwrap();
            out.write_all(&data).unwrap();
            let blob = out.finish().unwrap();
            let mut input = InStream::with_pool(Cursor::new(blob), &key, &pool).unwrap();
            assert_eq!(read_from(&mut input, 0), data);
        }
        assert!(pool.stats().reuse_count > 0);
    }

    fn arb_algorithm() -> impl Strategy<Value = CompressionAlgorithm> {
        prop_oneof![
            Just(CompressionAlgorithm::None),
            Just(CompressionAlgorithm::Snappy),
            Just(CompressionAlgorithm::Lz4),
            (1i32..6).prop_map(|level| CompressionAlgorithm::Zstd { level }),
        ]
    }

    fn arb_cipher() -> impl Strategy<Value = CipherAlgorithm> {
        prop_oneof![
            Just(CipherAlgorithm::AesGcm256),
            Just(CipherAlgorithm::ChaCha20Poly1305),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_composed_seek_reads_suffix(
            data in prop::collection::vec(0u8..8, 0..30_000),
            cipher in arb_cipher(),
            compression in arb_algorithm(),
            block_size in 64u32..5000,
            chunk_size in 256u32..9000,
            cut in any::<prop::sample::Index>(),
        ) {
            let key = test_key(9);
            let config = StreamConfig { block_size, chunk_size };
            let mut out = OutStream::with_options(
                Vec::new(),
                &key,
                Hint { cipher, compression },
                config,
                &BufferPool::default(),
            ).unwrap();
            out.write_all(&data).unwrap();
            let blob = out.finish().unwrap();

            let offset = cut.index(data.len() + 1);
            let mut input = InStream::new(Cursor::new(blob), &key).unwrap();
            prop_assert_eq!(input.plaintext_len().unwrap(), data.len() as u64);
            prop_assert_eq!(read_from(&mut input, offset as u64), &data[offset..]);
            prop_assert_eq!(read_from(&mut input, 0), data);
        }

        #[test]
        fn prop_compression_seek_end(
            data in prop::collection::vec(any::<u8>(), 1..20_000),
            back in 0usize..20_000,
        ) {
            let mut w = compression::Writer::with_options(
                Vec::new(),
                CompressionAlgorithm::Lz4,
                1024,
                &BufferPool::default(),
            ).unwrap();
            w.write_all(&data).unwrap();
            let blob = w.finish().unwrap();

            let back = back.min(data.len());
            let mut r = compression::Reader::new(Cursor::new(blob));
            let pos = r.seek(SeekFrom::End(-(back as i64))).unwrap();
            prop_assert_eq!(pos, (data.len() - back) as u64);
            let mut tail = Vec::new();
            r.read_to_end(&mut tail).unwrap();
            prop_assert_eq!(&tail[..], &data[data.len() - back..]);
        }
    }
}
