// AES-128-CBC segment decryption.

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};

use crate::error::StreamingError;
use crate::media::AesKey;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// IV implied by a media sequence number: the number as a 128-bit
/// big-endian integer.
pub fn sequence_number_iv(media_sequence_number: u64) -> [u8; 16] {
    (media_sequence_number as u128).to_be_bytes()
}

/// IV for the segment at `position` of its segment index.
pub fn segment_iv(key: &AesKey, position: u64) -> [u8; 16] {
    key.iv
        .unwrap_or_else(|| sequence_number_iv(key.first_media_sequence_number + position))
}

pub fn decrypt_sync(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Result<Bytes, StreamingError> {
    let mut buffer = data.to_vec();
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| StreamingError::decryption(format!("failed to initialize AES decryptor: {e}")))?;
    let decrypted_len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| StreamingError::decryption(e.to_string()))?
        .len();
    buffer.truncate(decrypted_len);
    Ok(Bytes::from(buffer))
}

/// Decrypt on the blocking pool so large segments do not stall the runtime.
pub async fn decrypt(data: Bytes, key: &AesKey, position: u64) -> Result<Bytes, StreamingError> {
    let iv = segment_iv(key, position);
    let key = key.key;
    tokio::task::spawn_blocking(move || decrypt_sync(&data, &key, &iv))
        .await
        .map_err(|e| StreamingError::decryption(format!("decryption task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
        let padded_len = (plaintext.len() / 16 + 1) * 16;
        let mut buffer = vec![0u8; padded_len];
        buffer[..plaintext.len()].copy_from_slice(plaintext);
        cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_sequence_number_iv_is_big_endian() {
        let iv = sequence_number_iv(0x0102);
        assert_eq!(&iv[..14], &[0u8; 14]);
        assert_eq!(&iv[14..], &[0x01, 0x02]);
    }

    #[test]
    fn test_explicit_iv_wins() {
        let key = AesKey {
            key: [1; 16],
            iv: Some([7; 16]),
            first_media_sequence_number: 10,
        };
        assert_eq!(segment_iv(&key, 3), [7; 16]);
        let implicit = AesKey { iv: None, ..key };
        assert_eq!(segment_iv(&implicit, 3), sequence_number_iv(13));
    }

    #[tokio::test]
    async fn test_decrypt_with_derived_iv() {
        let key = AesKey {
            key: [0x42; 16],
            iv: None,
            first_media_sequence_number: 100,
        };
        let plaintext = b"fragmented mp4 payload bytes";
        let encrypted = encrypt(plaintext, &key.key, &sequence_number_iv(102));

        let decrypted = decrypt(Bytes::from(encrypted), &key, 2).await.unwrap();
        assert_eq!(&decrypted[..], plaintext);
    }

    #[test]
    fn test_wrong_padding_is_an_error() {
        let result = decrypt_sync(&[0u8; 15], &[0; 16], &[0; 16]);
        assert!(matches!(result, Err(StreamingError::Decryption { .. })));
    }
}
