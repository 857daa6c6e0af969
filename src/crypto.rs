//! aes256-cts-hmac-sha1-96 as described in rfc3961 and rfc3962.
//!
//! Every sealed structure in this crate goes through `encrypt_aes256_cts_hmac_sha1_96`
//! and `decrypt_aes256_cts_hmac_sha1_96`. A random confounder block is prepended to the
//! plaintext, the result is encrypted with AES-256 in CBC mode with ciphertext stealing,
//! and a truncated HMAC-SHA1 over confounder and plaintext is appended. The encryption
//! and integrity keys are derived from the base key and a key usage number, so bytes
//! sealed for one purpose never open for another.

use crate::constants::{AES_256_KEY_LEN, AES_BLOCK_SIZE, IV_ZERO, SHA1_HMAC_LEN};
use crate::error::KrbError;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes256;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha1::Sha1;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

type Aes256Block = GenericArray<u8, <Aes256 as aes::cipher::BlockSizeUser>::BlockSize>;
type Aes256Key = GenericArray<u8, <Aes256 as aes::cipher::KeySizeUser>::KeySize>;

type HmacSha1 = Hmac<Sha1>;

const DK_CONSTANT_KERBEROS: &[u8] = b"kerberos";
const DK_SUFFIX_KE: u8 = 0xAA;
const DK_SUFFIX_KI: u8 = 0x55;

/// Stretch or shrink `input` to `out_len` bytes with the rfc3961 n-fold operation.
///
/// The input is repeated, each repetition rotated right by 13 bits, until the total
/// length is the lcm of both lengths. That buffer is then cut into `out_len` sized
/// pieces which are summed with one's complement addition.
pub(crate) fn n_fold(input: &[u8], out_len: usize) -> Vec<u8> {
    let in_len = input.len();
    let mut out = vec![0u8; out_len];

    if in_len == 0 || out_len == 0 {
        return out;
    }

    let lcm = out_len * in_len / gcd(out_len, in_len);
    let in_bits = in_len << 3;

    let mut carry: u32 = 0;

    for i in (0..lcm).rev() {
        // Locate the most significant bit of the input that lands in this output byte,
        // after accounting for the 13 bit rotation of each repetition.
        let msbit = ((in_bits - 1) + ((in_bits + 13) * (i / in_len)) + ((in_len - (i % in_len)) << 3))
            % in_bits;

        let hi = input[((in_len - 1) - (msbit >> 3)) % in_len] as u32;
        let lo = input[(in_len - (msbit >> 3)) % in_len] as u32;

        carry += (((hi << 8) | lo) >> ((msbit & 7) + 1)) & 0xff;
        carry += out[i % out_len] as u32;
        out[i % out_len] = (carry & 0xff) as u8;
        carry >>= 8;
    }

    // End around carry.
    if carry != 0 {
        for byte in out.iter_mut().rev() {
            carry += *byte as u32;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
    }

    out
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let c = b;
        b = a % b;
        a = c;
    }
    a
}

/// Given a passphrase, a salt and the iteration count, derive a base key. The salt
/// we use is the principal identifier.
pub(crate) fn derive_key_aes256_cts_hmac_sha1_96(
    passphrase: &[u8],
    salt: &[u8],
    iter_count: u32,
) -> [u8; AES_256_KEY_LEN] {
    let mut buf = [0u8; AES_256_KEY_LEN];
    pbkdf2_hmac::<Sha1>(passphrase, salt, iter_count, &mut buf);

    dk_aes_256(&buf, DK_CONSTANT_KERBEROS)
}

/// The rfc3961 DK function. The constant is folded to a single block, which is then
/// encrypted repeatedly under the base key until we have a full key worth of output.
fn dk_aes_256(base: &[u8; AES_256_KEY_LEN], constant: &[u8]) -> [u8; AES_256_KEY_LEN] {
    let mut folded = [0u8; AES_BLOCK_SIZE];
    folded.copy_from_slice(&n_fold(constant, AES_BLOCK_SIZE));

    let mut out = [0u8; AES_256_KEY_LEN];
    let (lower, upper) = out.split_at_mut(AES_BLOCK_SIZE);
    debug_assert!(lower.len() == AES_BLOCK_SIZE);
    debug_assert!(upper.len() == AES_BLOCK_SIZE);
    dk_encrypt_aes_256_cbc(base.into(), (&folded).into(), lower.into());
    dk_encrypt_aes_256_cbc(base.into(), (&*lower).into(), upper.into());

    out
}

fn dk_encrypt_aes_256_cbc(key: &Aes256Key, plaintext: &Aes256Block, out_buf: &mut Aes256Block) {
    Aes256CbcEnc::new(key, &IV_ZERO.into()).encrypt_block_b2b_mut(plaintext, out_buf)
}

fn usage_constant(key_usage: u32, suffix: u8) -> [u8; 5] {
    let mut constant = [suffix; 5];
    constant[..4].copy_from_slice(&key_usage.to_be_bytes());
    constant
}

fn dk_ki_ke_aes_256(
    base: &[u8; AES_256_KEY_LEN],
    key_usage: u32,
) -> ([u8; AES_256_KEY_LEN], [u8; AES_256_KEY_LEN]) {
    let ki = dk_aes_256(base, &usage_constant(key_usage, DK_SUFFIX_KI));
    let ke = dk_aes_256(base, &usage_constant(key_usage, DK_SUFFIX_KE));
    (ki, ke)
}

/// Given the base key and the key_usage value encrypt and authenticate the provided
/// plaintext. The output is confounder and ciphertext, followed by the 96 bit hmac.
pub(crate) fn encrypt_aes256_cts_hmac_sha1_96(
    key: &[u8; AES_256_KEY_LEN],
    plaintext: &[u8],
    key_usage: u32,
) -> Result<Vec<u8>, KrbError> {
    if plaintext.is_empty() {
        return Err(KrbError::PlaintextEmpty);
    };
    let (ki, ke) = dk_ki_ke_aes_256(key, key_usage);

    let mut confounder = [0u8; AES_BLOCK_SIZE];
    rand::rng().fill(&mut confounder);

    let mut mac =
        <HmacSha1 as Mac>::new_from_slice(&ki).map_err(|_| KrbError::InvalidHmacSha1Key)?;
    mac.update(&confounder);
    mac.update(plaintext);
    let tag = mac.finalize().into_bytes();

    let mut ciphertext = vec![0u8; AES_BLOCK_SIZE + plaintext.len() + SHA1_HMAC_LEN];
    let (cipher, hmac) = ciphertext.split_at_mut(AES_BLOCK_SIZE + plaintext.len());

    encrypt_aes256_cts(&ke, &confounder, plaintext, cipher)?;
    hmac.copy_from_slice(&tag[..SHA1_HMAC_LEN]);

    Ok(ciphertext)
}

/// Given the base key and the key_usage value decrypt and authenticate the provided
/// ciphertext. Nothing is returned unless the hmac verifies.
pub(crate) fn decrypt_aes256_cts_hmac_sha1_96(
    key: &[u8; AES_256_KEY_LEN],
    ciphertext: &[u8],
    key_usage: u32,
) -> Result<Vec<u8>, KrbError> {
    let Some((ciphertext, msg_hmac)) = ciphertext.split_last_chunk::<SHA1_HMAC_LEN>() else {
        return Err(KrbError::InsufficientData);
    };

    if ciphertext.is_empty() {
        return Err(KrbError::MessageEmpty);
    };

    // The confounder plus at least one byte of plaintext.
    if ciphertext.len() <= AES_BLOCK_SIZE {
        return Err(KrbError::CtsCiphertextInvalid);
    }

    let (ki, ke) = dk_ki_ke_aes_256(key, key_usage);

    let mut plaintext = decrypt_aes256_cts(&ke, ciphertext)?;

    let mut mac =
        <HmacSha1 as Mac>::new_from_slice(&ki).map_err(|_| KrbError::InvalidHmacSha1Key)?;
    mac.update(&plaintext);

    // Constant time comparison against the leftmost 96 bits.
    mac.verify_truncated_left(msg_hmac)
        .map_err(|_| KrbError::MessageAuthenticationFailed)?;

    // Drop the confounder.
    Ok(plaintext.split_off(AES_BLOCK_SIZE))
}

fn encrypt_aes256_cts(
    key: &[u8; AES_256_KEY_LEN],
    confounder: &[u8; AES_BLOCK_SIZE],
    plaintext: &[u8],
    ciphertext: &mut [u8],
) -> Result<(), KrbError> {
    debug_assert!(ciphertext.len() == plaintext.len() + AES_BLOCK_SIZE);

    let plaintext_chunks = plaintext.chunks(AES_BLOCK_SIZE);
    let mut ciphertext_chunks = ciphertext.chunks_mut(AES_BLOCK_SIZE);

    // The confounder occupies the first ciphertext chunk, so there is always one more
    // ciphertext chunk than plaintext chunks.
    let mut previous_chunk = ciphertext_chunks
        .next()
        .ok_or(KrbError::InsufficientData)?;

    let mut chunks = std::iter::zip(ciphertext_chunks, plaintext_chunks);

    // The final plaintext chunk may be short, and is the one that gets stolen.
    let (c_n_chunk, p_n_star_chunk) = chunks.next_back().ok_or(KrbError::InsufficientData)?;

    let mut cipher = Aes256CbcEnc::new(key.into(), &IV_ZERO.into());

    let mut previous_block = *confounder;
    cipher.encrypt_block_mut((&mut previous_block).into());
    previous_chunk.copy_from_slice(&previous_block);

    for (cipher_chunk, plain_chunk) in chunks {
        previous_block.copy_from_slice(plain_chunk);
        cipher.encrypt_block_mut((&mut previous_block).into());
        cipher_chunk.copy_from_slice(&previous_block);
        previous_chunk = cipher_chunk;
    }

    // previous_chunk and previous_block both hold Cn-1 now.
    let c_n1_chunk = previous_chunk;
    let c_n1_block = previous_block;
    debug_assert!(*c_n1_chunk == c_n1_block);

    let p_n_star_len = p_n_star_chunk.len();

    // Pn is zero padded, then chained with Cn-1. Padding xor Cn-1 is just the tail of
    // Cn-1, so we copy it rather than xor it.
    let mut c_n_block: Aes256Block = [0u8; AES_BLOCK_SIZE].into();
    let (p_n_star, c_n_star_2) = c_n_block.split_at_mut(p_n_star_len);
    let (c_n1_star, c_n1_star_2) = c_n1_block.split_at(p_n_star_len);

    p_n_star
        .iter_mut()
        .zip(p_n_star_chunk.iter().zip(c_n1_star.iter()))
        .for_each(|(out, (p, c))| *out = p ^ c);
    c_n_star_2.copy_from_slice(c_n1_star_2);

    let mut raw_cipher = Aes256::new(key.into());
    raw_cipher.encrypt_block_mut(&mut c_n_block);

    // CS3 always swaps the final two blocks, truncating what was Cn-1.
    c_n1_chunk.copy_from_slice(&c_n_block);
    c_n_chunk.copy_from_slice(c_n1_star);

    Ok(())
}

fn decrypt_aes256_cts(key: &[u8; AES_256_KEY_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, KrbError> {
    let ctxt_len = ciphertext.len();

    if ctxt_len <= AES_BLOCK_SIZE {
        return Err(KrbError::CtsCiphertextInvalid);
    }

    let mut cipher = Aes256CbcDec::new(key.into(), &IV_ZERO.into());

    let mut plaintext = vec![0u8; ctxt_len];

    let plaintext_chunks = plaintext.chunks_mut(AES_BLOCK_SIZE);
    let ciphertext_chunks = ciphertext.chunks(AES_BLOCK_SIZE);

    let mut chunks = std::iter::zip(ciphertext_chunks, plaintext_chunks);

    // On the wire the last two blocks are swapped: C1 || ... || Cn-2 || Cn || Cn-1*
    let (c_n1_chunk, p_n_chunk) = chunks.next_back().ok_or(KrbError::InsufficientData)?;
    let (c_n_chunk, p_n1_chunk) = chunks.next_back().ok_or(KrbError::InsufficientData)?;

    // Up to Cn-2 this is plain CBC.
    for (cipher_chunk, plain_chunk) in chunks {
        cipher.decrypt_block_b2b_mut(cipher_chunk.into(), plain_chunk.into())
    }

    // Decrypting Cn with the raw cipher gives Z. The head of Z xor Cn-1* is Pn, and the
    // tail of Z is the stolen tail of Cn-1.
    let mut z: Aes256Block = [0u8; AES_BLOCK_SIZE].into();
    let mut raw_cipher = Aes256::new(key.into());

    let z_star_len = c_n1_chunk.len();

    raw_cipher.decrypt_block_b2b_mut(c_n_chunk.into(), &mut z);

    let (z_star, z_star_2) = z.split_at(z_star_len);
    debug_assert!(z_star.len() == p_n_chunk.len());

    p_n_chunk
        .iter_mut()
        .zip(c_n1_chunk.iter().zip(z_star.iter()))
        .for_each(|(out, (c, z))| *out = c ^ z);

    // Rebuild the full Cn-1, and finish the CBC chain with it. The cbc cipher still
    // holds Cn-2 as its chaining value.
    let mut cn1_block: Aes256Block = [0u8; AES_BLOCK_SIZE].into();
    let (cn1_block_star, cn1_block_star_2) = cn1_block.split_at_mut(z_star_len);
    cn1_block_star.copy_from_slice(c_n1_chunk);
    cn1_block_star_2.copy_from_slice(z_star_2);

    cipher.decrypt_block_b2b_mut(&cn1_block, p_n1_chunk.into());

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RFC_PBKDF2_SHA1_ITER;
    use assert_hex::assert_eq_hex;

    // https://www.rfc-editor.org/rfc/rfc3961#appendix-A.1
    #[test]
    fn test_n_fold_rfc3961_vectors() {
        assert_eq_hex!(
            n_fold(b"012345", 8),
            hex::decode("be072631276b1955").unwrap()
        );
        assert_eq_hex!(
            n_fold(b"password", 7),
            hex::decode("78a07b6caf85fa").unwrap()
        );
        assert_eq_hex!(
            n_fold(b"Rough Consensus, and Running Code", 8),
            hex::decode("bb6ed30870b7f0e0").unwrap()
        );
        assert_eq_hex!(
            n_fold(b"password", 21),
            hex::decode("59e4a8ca7c0385c3c37b3f6d2000247cb6e6bd5b3e").unwrap()
        );
        assert_eq_hex!(
            n_fold(b"kerberos", 16),
            hex::decode("6b65726265726f737b9b5b2b93132b93").unwrap()
        );
        assert_eq_hex!(
            n_fold(b"kerberos", 21),
            hex::decode("8372c236344e5f1550cd0747e15d62ca7a5a3bcea4").unwrap()
        );
        assert_eq_hex!(
            n_fold(b"Q", 21),
            hex::decode("518a54a215a8452a518a54a215a8452a518a54a215").unwrap()
        );
    }

    #[test]
    fn test_hmac_sha1_96_kerbeiros() {
        let out_key = derive_key_aes256_cts_hmac_sha1_96(
            "Minnie1234".as_bytes(),
            "KINGDOM.HEARTSmickey".as_bytes(),
            RFC_PBKDF2_SHA1_ITER,
        );

        assert_eq_hex!(
            hex::decode("d3301f0f2539cc4026a569f8b7c36715c8daef109fa3d8b2e14616aacab549fd")
                .unwrap(),
            out_key.to_vec(),
        )
    }

    // https://www.rfc-editor.org/rfc/rfc3962#appendix-B
    #[test]
    fn test_string_to_key_rfc3962_vectors() {
        let out_key = derive_key_aes256_cts_hmac_sha1_96(
            "password".as_bytes(),
            "ATHENA.MIT.EDUraeburn".as_bytes(),
            1,
        );
        assert_eq_hex!(
            hex::decode("fe697b52bc0d3ce14432ba036a92e65bbb52280990a2fa27883998d72af30161")
                .unwrap(),
            out_key.to_vec(),
        );

        let out_key = derive_key_aes256_cts_hmac_sha1_96(
            "password".as_bytes(),
            "ATHENA.MIT.EDUraeburn".as_bytes(),
            1200,
        );
        assert_eq_hex!(
            hex::decode("55a6ac740ad17b4846941051e1e8b0a7548d93b0ab30a8bc3ff16280382b8c2a")
                .unwrap(),
            out_key.to_vec(),
        );
    }

    // Ciphertext produced by MIT krb5, so this covers the derivation of ke/ki too.
    #[test]
    fn test_aes256_cts_hmac_sha1_96_decrypt_mit() {
        let out_key = derive_key_aes256_cts_hmac_sha1_96(
            "admin".as_bytes(),
            "admin1234".as_bytes(),
            RFC_PBKDF2_SHA1_ITER,
        );

        let input_data = hex::decode(
            "29737f3db6bcdfe9990fb2136d3efe6f2100e6c4ac75824299d8d3702f5a2e31c7a336747dfd734a1ea0165ebb27c0d7ce9b5aec7a",
        )
        .unwrap();

        let data = decrypt_aes256_cts_hmac_sha1_96(&out_key, &input_data, 1).unwrap();

        assert_eq!(data, b"3ahwzt9MG9WVEuBVC5j0oi6sI".to_vec());

        let out_key = derive_key_aes256_cts_hmac_sha1_96(
            "test".as_bytes(),
            "test1234".as_bytes(),
            RFC_PBKDF2_SHA1_ITER,
        );

        let input_data = hex::decode(
            "3d291c685489e7b75dabdc6e010ad0019db16481b12cb8bfa513619242761f990de2c027661c9833bcced3",
        )
        .unwrap();

        let data = decrypt_aes256_cts_hmac_sha1_96(&out_key, &input_data, 2).unwrap();

        assert_eq!(data, b"lJ3ftfwxjsR522O".to_vec());
    }

    #[test]
    fn test_aes256_cts_hmac_sha1_96_reflexive() {
        let key = [0x42u8; AES_256_KEY_LEN];

        // Less than a block, exactly a block, aligned multiple blocks, unaligned multiple blocks.
        for len in [1usize, 8, 16, 32, 49] {
            let input_data = vec![0xa5u8; len];
            let enc_data = encrypt_aes256_cts_hmac_sha1_96(&key, &input_data, 5).unwrap();
            assert_eq!(enc_data.len(), len + AES_BLOCK_SIZE + SHA1_HMAC_LEN);

            let data = decrypt_aes256_cts_hmac_sha1_96(&key, &enc_data, 5).unwrap();
            assert_eq!(data, input_data);
        }
    }

    #[test]
    fn test_aes256_cts_hmac_sha1_96_confounder_randomises() {
        let key = [0x01u8; AES_256_KEY_LEN];
        let a = encrypt_aes256_cts_hmac_sha1_96(&key, b"same plaintext", 2).unwrap();
        let b = encrypt_aes256_cts_hmac_sha1_96(&key, b"same plaintext", 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_aes256_cts_hmac_sha1_96_rejects_tampering() {
        let key = [0x17u8; AES_256_KEY_LEN];
        let enc_data = encrypt_aes256_cts_hmac_sha1_96(&key, b"attack at dawn!!?", 2).unwrap();

        for byte in 0..enc_data.len() {
            let mut tampered = enc_data.clone();
            tampered[byte] ^= 0x01;
            assert!(matches!(
                decrypt_aes256_cts_hmac_sha1_96(&key, &tampered, 2),
                Err(KrbError::MessageAuthenticationFailed)
            ));
        }
    }

    #[test]
    fn test_aes256_cts_hmac_sha1_96_wrong_key_or_usage() {
        let key = [0x17u8; AES_256_KEY_LEN];
        let other = [0x18u8; AES_256_KEY_LEN];
        let enc_data = encrypt_aes256_cts_hmac_sha1_96(&key, b"sealed", 2).unwrap();

        assert!(decrypt_aes256_cts_hmac_sha1_96(&other, &enc_data, 2).is_err());
        assert!(decrypt_aes256_cts_hmac_sha1_96(&key, &enc_data, 7).is_err());
    }

    #[test]
    fn test_aes256_cts_hmac_sha1_96_short_input() {
        let key = [0x17u8; AES_256_KEY_LEN];
        assert!(matches!(
            decrypt_aes256_cts_hmac_sha1_96(&key, &[0u8; 4], 2),
            Err(KrbError::InsufficientData)
        ));
        assert!(matches!(
            decrypt_aes256_cts_hmac_sha1_96(&key, &[0u8; 20], 2),
            Err(KrbError::CtsCiphertextInvalid)
        ));
        assert!(matches!(
            encrypt_aes256_cts_hmac_sha1_96(&key, &[], 2),
            Err(KrbError::PlaintextEmpty)
        ));
    }
}
