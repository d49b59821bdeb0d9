use crate::hexstring::HexData;
use aes::Aes128;
use binrw::{BinRead, BinWrite};
use cipher::generic_array::GenericArray;
use ctr::Ctr128BE;
use hex::FromHexError;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::str::FromStr;
use xts_mode::Xts128;

pub mod keyset;
pub mod pki;

#[derive(Snafu, Debug)]
pub enum KeyParseError {
    InvalidLength { expected: usize, actual: usize },
    InvalidChar { char: char, index: usize },
}

/// An AES-128 key still wrapped by a key-area KEK.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, BinRead, BinWrite)]
pub struct EncryptedAesKey(pub HexData<0x10>);
/// An AES-128-XTS key pair still wrapped by a key-area KEK.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, BinRead, BinWrite)]
pub struct EncryptedAesXtsKey(pub HexData<0x20>);

/// Represents an encrypted AES-128 title key.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TitleKey(HexData<0x10>);
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AesKey(HexData<0x10>);
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AesXtsKey(HexData<0x20>);

fn parse_key(s: &str, result: &mut [u8]) -> Result<(), KeyParseError> {
    hex::decode_to_slice(s, result).map_err(|e| match e {
        FromHexError::InvalidHexCharacter { c, index } => {
            KeyParseError::InvalidChar { char: c, index }
        }
        FromHexError::OddLength | FromHexError::InvalidStringLength => {
            KeyParseError::InvalidLength {
                expected: result.len() * 2,
                actual: s.len(),
            }
        }
    })?;
    Ok(())
}

impl FromStr for AesKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_key(s, &mut result).map(|_| AesKey(HexData(result)))
    }
}

impl FromStr for AesXtsKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x20];
        parse_key(s, &mut result).map(|_| AesXtsKey(HexData(result)))
    }
}

impl FromStr for TitleKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_key(s, &mut result).map(|_| TitleKey(HexData(result)))
    }
}

impl TitleKey {
    pub fn decrypt(&self, title_kek: AesKey) -> AesKey {
        title_kek.derive_key(&self.0 .0)
    }
}

impl From<[u8; 0x10]> for TitleKey {
    fn from(data: [u8; 0x10]) -> Self {
        TitleKey(HexData(data))
    }
}

impl From<[u8; 0x10]> for AesKey {
    fn from(data: [u8; 0x10]) -> Self {
        AesKey(HexData(data))
    }
}

impl AesKey {
    fn derive_key(&self, source: &[u8; 0x10]) -> AesKey {
        use cipher::{BlockDecrypt, KeyInit};
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey));

        AesKey(HexData(newkey))
    }

    pub fn decrypt_key(&self, source: EncryptedAesKey) -> AesKey {
        self.derive_key(&source.0 .0)
    }

    fn derive_xts_key(&self, source: &[u8; 0x20]) -> AesXtsKey {
        use cipher::{BlockDecrypt, KeyInit};
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey[0x00..0x10]));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey[0x10..0x20]));

        AesXtsKey(HexData(newkey))
    }

    pub fn decrypt_xts_key(&self, source: EncryptedAesXtsKey) -> AesXtsKey {
        self.derive_xts_key(&source.0 .0)
    }

    /// Decrypt blocks in CTR mode.
    pub fn decrypt_ctr(&self, buf: &mut [u8], ctr: &[u8; 0x10]) {
        use cipher::{KeyIvInit, StreamCipher};

        if buf.len() % 16 != 0 {
            panic!("Length must be multiple of AES blocks!")
        }

        let key = GenericArray::from_slice(&self.0 .0);
        let iv = GenericArray::from_slice(ctr);
        let mut crypter = Ctr128BE::<Aes128>::new(key, iv);
        crypter.apply_keystream(buf);
    }

    pub fn encrypt_ctr(&self, buf: &mut [u8], ctr: &[u8; 0x10]) {
        // CTR is an XOR with the keystream, same in both directions
        self.decrypt_ctr(buf, ctr);
    }

    /// XOR the CTR keystream into a buffer that does not start on an AES
    /// block boundary. `offset_in_block` is the byte position within the
    /// block the counter refers to.
    pub fn decrypt_ctr_unaligned(&self, buf: &mut [u8], ctr: &[u8; 0x10], offset_in_block: usize) {
        use cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

        assert!(offset_in_block < 0x10);

        let key = GenericArray::from_slice(&self.0 .0);
        let iv = GenericArray::from_slice(ctr);
        let mut crypter = Ctr128BE::<Aes128>::new(key, iv);
        crypter.seek(offset_in_block as u64);
        crypter.apply_keystream(buf);
    }

    /// Decrypt a CBC-chained buffer. Used by the boot package decoders.
    pub fn decrypt_cbc(&self, buf: &mut [u8], iv: &[u8; 0x10]) {
        use cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};

        if buf.len() % 16 != 0 {
            panic!("Length must be multiple of AES blocks!")
        }

        cbc::Decryptor::<Aes128>::new(
            GenericArray::from_slice(&self.0 .0),
            GenericArray::from_slice(iv),
        )
        .decrypt_padded_mut::<NoPadding>(buf)
        .expect("BUG: unpadded CBC decryption cannot fail on aligned input");
    }

    /// Compute an AES-CMAC over the buffer.
    pub fn cmac(&self, buf: &[u8]) -> [u8; 0x10] {
        use cmac::{Cmac, Mac};

        let mut mac = Cmac::<Aes128>::new(GenericArray::from_slice(&self.0 .0));
        mac.update(buf);
        mac.finalize().into_bytes().into()
    }
}

fn get_tweak(mut sector: usize) -> [u8; 0x10] {
    let mut tweak = [0; 0x10];
    for tweak in tweak.iter_mut().rev() {
        /* Nintendo LE custom tweak... */
        *tweak = (sector & 0xFF) as u8;
        sector >>= 8;
    }
    tweak
}

impl AesXtsKey {
    #[inline]
    fn to_crypter(&self) -> Xts128<Aes128> {
        use cipher::KeyInit;

        let key1 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x00..0x10]));
        let key2 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x10..0x20]));
        Xts128::<Aes128>::new(key1, key2)
    }

    pub fn decrypt(&self, data: &mut [u8], mut sector: usize, sector_size: usize) {
        if data.len() % sector_size != 0 {
            panic!("Length must be multiple of sectors!")
        }

        let crypter = self.to_crypter();

        for i in (0..data.len()).step_by(sector_size) {
            let tweak = get_tweak(sector);

            crypter.decrypt_sector(&mut data[i..i + sector_size], tweak);
            sector += 1;
        }
    }

    pub fn encrypt(&self, data: &mut [u8], mut sector: usize, sector_size: usize) {
        if data.len() % sector_size != 0 {
            panic!("Length must be multiple of sectors!")
        }

        let crypter = self.to_crypter();

        for i in (0..data.len()).step_by(sector_size) {
            let tweak = get_tweak(sector);

            crypter.encrypt_sector(&mut data[i..i + sector_size], tweak);
            sector += 1;
        }
    }
}

pub fn sha256(data: &[u8]) -> [u8; 0x20] {
    use digest::Digest;
    sha2::Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: AesKey = AesKey(HexData([
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ]));

    #[test]
    fn ctr_roundtrip() {
        let mut ctr = [0u8; 0x10];
        ctr[0xf] = 0x2a;

        let original = *b"0123456789abcdef0123456789abcdef";
        let mut buf = original;
        KEY.decrypt_ctr(&mut buf, &ctr);
        assert_ne!(buf, original);
        KEY.decrypt_ctr(&mut buf, &ctr);
        assert_eq!(buf, original);
    }

    #[test]
    fn ctr_unaligned_matches_aligned() {
        let ctr = [0x13u8; 0x10];

        let mut aligned = [0u8; 0x20];
        KEY.decrypt_ctr(&mut aligned, &ctr);

        // decrypting the tail starting 5 bytes into the first block must
        // produce the same keystream bytes
        let mut tail = [0u8; 0x1b];
        KEY.decrypt_ctr_unaligned(&mut tail, &ctr, 5);
        assert_eq!(&tail[..], &aligned[5..]);
    }

    #[test]
    fn xts_sectors_are_independent() {
        let key = AesXtsKey(HexData([0x42; 0x20]));

        let mut both = [0u8; 0x400];
        both[..0x200].copy_from_slice(&[0xaa; 0x200]);
        both[0x200..].copy_from_slice(&[0xbb; 0x200]);
        key.decrypt(&mut both, 7, 0x200);

        let mut second_alone = [0xbb; 0x200];
        key.decrypt(&mut second_alone, 8, 0x200);
        assert_eq!(&both[0x200..], &second_alone[..]);
    }

    #[test]
    fn cmac_is_deterministic() {
        let a = KEY.cmac(b"some message");
        let b = KEY.cmac(b"some message");
        let c = KEY.cmac(b"some messagf");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tweak_is_big_endian() {
        let tweak = get_tweak(0x0102);
        assert_eq!(tweak[0xe..], [0x01, 0x02]);
        assert!(tweak[..0xe].iter().all(|&b| b == 0));
    }
}
