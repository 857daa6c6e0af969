use binrw::helpers::until_eof;
use binrw::io::{Cursor, Read, Seek, Write};
use binrw::{binread, binwrite, BinReaderExt, BinWrite};
use std::fmt;
use std::fs::File;
use std::path::Path;
use tracing::error;

use crate::error::KrbError;
use crate::proto::{Data, DerivedKey};

#[binread]
#[binwrite]
#[brw(big)]
#[derive(Clone, PartialEq, Eq)]
struct Record {
    principal: Data,
    kvno: u32,
    key: Data,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field(
                "principal",
                &String::from_utf8_lossy(self.principal.value.as_slice()),
            )
            .field("kvno", &self.kvno)
            .field("key_len", &self.key.value.len())
            .finish()
    }
}

#[binread]
#[binwrite]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileKeytabV1 {
    #[br(parse_with = until_eof)]
    records: Vec<Record>,
}

#[binread]
#[binwrite]
#[brw(big, magic = 0x4bu8)]
#[derive(Debug, Clone, PartialEq, Eq)]
enum FileKeytab {
    #[brw(magic = 1u8)]
    V1(FileKeytabV1),
}

/** External API **/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeytabEntry {
    pub principal: String,
    pub key: DerivedKey,
    pub kvno: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keytab {
    File(Vec<KeytabEntry>),
}

impl From<&KeytabEntry> for Record {
    fn from(value: &KeytabEntry) -> Self {
        Record {
            principal: value.principal.as_str().into(),
            kvno: value.kvno,
            key: value.key.k().as_slice().into(),
        }
    }
}

impl TryFrom<Record> for KeytabEntry {
    type Error = KrbError;

    fn try_from(value: Record) -> Result<Self, Self::Error> {
        let key = DerivedKey::try_from(value.key.value.as_slice())?;
        let principal = value.principal.try_into()?;
        Ok(KeytabEntry {
            principal,
            key,
            kvno: value.kvno,
        })
    }
}

impl From<&Keytab> for FileKeytab {
    fn from(value: &Keytab) -> Self {
        match value {
            Keytab::File(entries) => FileKeytab::V1(FileKeytabV1 {
                records: entries.iter().map(Record::from).collect(),
            }),
        }
    }
}

impl Keytab {
    pub fn entries(&self) -> &[KeytabEntry] {
        match self {
            Keytab::File(entries) => entries.as_slice(),
        }
    }

    pub fn read(inner: &[u8]) -> Result<Self, KrbError> {
        let mut reader = Cursor::new(inner);
        let keytab: FileKeytab = reader.read_type(binrw::Endian::Big).map_err(|err| {
            error!(?err, "Unable to parse keytab");
            KrbError::KeytabFileError
        })?;

        match keytab {
            FileKeytab::V1(v1) => v1
                .records
                .into_iter()
                .map(KeytabEntry::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(Keytab::File),
        }
    }

    pub fn write<W: Write + Seek>(&self, writer: &mut W) -> Result<(), KrbError> {
        let fk: FileKeytab = self.into();
        fk.write(writer).map_err(|err| {
            error!(?err, "Unable to write keytab");
            KrbError::KeytabFileError
        })
    }

    pub fn load(path: &Path) -> Result<Self, KrbError> {
        let mut f = File::open(path).map_err(|err| {
            error!(?err, ?path, "Unable to open keytab");
            KrbError::KeytabFileError
        })?;
        let mut buffer = Vec::new();
        f.read_to_end(&mut buffer)?;
        Keytab::read(&buffer)
    }

    pub fn store(&self, path: &Path) -> Result<(), KrbError> {
        let mut f = File::create(path).map_err(|err| {
            error!(?err, ?path, "Unable to create keytab");
            KrbError::KeytabFileError
        })?;
        self.write(&mut f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_hex::assert_eq_hex;

    fn entry(principal: &str, byte: u8, kvno: u32) -> KeytabEntry {
        KeytabEntry {
            principal: principal.to_string(),
            key: DerivedKey::try_from([byte; 32].as_slice()).unwrap(),
            kvno,
        }
    }

    #[test]
    fn test_keytab_layout() {
        let keytab = Keytab::File(vec![entry("svc", 0xAA, 2)]);

        let mut c = Cursor::new(Vec::new());
        keytab.write(&mut c).expect("Failed to write");
        let buf = c.into_inner();

        let mut expect = hex::decode("4b010003737663000000020020").unwrap();
        expect.extend_from_slice(&[0xAA; 32]);
        assert_eq_hex!(buf, expect);

        let read_back = Keytab::read(&buf).expect("Failed to read from buffer");
        assert_eq!(read_back, keytab);
    }

    #[test]
    fn test_keytab_load_store() {
        let keytab = Keytab::File(vec![
            entry("krbtgt", 0x01, 1),
            entry("host/files", 0x02, 3),
        ]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("krb5.keytab");
        keytab.store(&path).expect("Failed to store");

        let loaded = Keytab::load(&path).expect("Failed to load");
        assert_eq!(loaded.entries().len(), 2);
        assert_eq!(loaded.entries()[1].principal, "host/files");
        assert_eq!(loaded.entries()[1].kvno, 3);
        assert_eq!(loaded, keytab);
    }

    #[test]
    fn test_keytab_empty() {
        let keytab = Keytab::read(&[0x4b, 0x01]).expect("Failed to read empty keytab");
        assert!(keytab.entries().is_empty());
    }

    #[test]
    fn test_keytab_invalid() {
        // MIT keytabs start with 0x05.
        assert_eq!(
            Keytab::read(&[0x05, 0x02]),
            Err(KrbError::KeytabFileError)
        );
        // Unknown version.
        assert_eq!(
            Keytab::read(&[0x4b, 0x02]),
            Err(KrbError::KeytabFileError)
        );
        // Key of the wrong length.
        assert_eq!(
            Keytab::read(&hex::decode("4b01000161000000010002abcd").unwrap()),
            Err(KrbError::InvalidEncryptionKey)
        );
        assert!(Keytab::load(Path::new("/nonexistent/krb5.keytab")).is_err());
    }
}
