//! レコードファイルの I/O
//!
//! ファイルは `u32 LE 長さ + ペイロード` の繰り返し。
//! 圧縮方式はデータセットごとに宣言し、拡張子やマジックからは推測しない。

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DecodeError, PipelineError, PipelineResult};
use crate::record::PAYLOAD_SIZE;

const READER_BUF_CAP: usize = 128 * 1024; // 128 KiB

/// 圧縮方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zlib,
}

impl FromStr for Compression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            "zlib" => Ok(Self::Zlib),
            _ => Err(ConfigError::UnknownCompression(s.to_string())),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zlib => "zlib",
        })
    }
}

/// 宣言された圧縮方式でファイルを開く
pub fn open_reader<P: AsRef<Path>>(
    path: P,
    compression: Compression,
) -> io::Result<Box<dyn BufRead + Send>> {
    let f = File::open(path.as_ref())?;
    Ok(match compression {
        Compression::None => Box::new(BufReader::with_capacity(READER_BUF_CAP, f)),
        Compression::Gzip => Box::new(BufReader::with_capacity(
            READER_BUF_CAP,
            flate2::read::MultiGzDecoder::new(f),
        )),
        Compression::Zlib => Box::new(BufReader::with_capacity(
            READER_BUF_CAP,
            flate2::read::ZlibDecoder::new(f),
        )),
    })
}

/// フレーム単位でペイロードを読み出すリーダ
pub struct RecordReader {
    path: PathBuf,
    inner: Box<dyn BufRead + Send>,
    index: u64,
}

impl RecordReader {
    pub fn open(path: &Path, compression: Compression) -> PipelineResult<Self> {
        let inner = open_reader(path, compression)
            .map_err(|source| PipelineError::Open { path: path.to_path_buf(), source })?;
        Ok(Self { path: path.to_path_buf(), inner, index: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 読み出し済みレコード数
    pub fn records_read(&self) -> u64 {
        self.index
    }

    /// 次のペイロード。レコード境界での EOF は `Ok(None)`
    pub fn next_record(&mut self) -> PipelineResult<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        let mut read = 0;
        while read < header.len() {
            match self.inner.read(&mut header[read..]) {
                Ok(0) if read == 0 => return Ok(None),
                Ok(0) => {
                    return Err(DecodeError::TruncatedHeader {
                        path: self.path.clone(),
                        index: self.index,
                        read,
                    }
                    .into());
                }
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let length = (&header[..]).read_u32::<LittleEndian>()?;
        if length as usize != PAYLOAD_SIZE {
            return Err(DecodeError::BadLength { path: self.path.clone(), index: self.index, length }
                .into());
        }

        let mut payload = vec![0u8; PAYLOAD_SIZE];
        if let Err(e) = self.inner.read_exact(&mut payload) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Err(DecodeError::TruncatedPayload {
                    path: self.path.clone(),
                    index: self.index,
                    expected: PAYLOAD_SIZE,
                }
                .into());
            }
            return Err(e.into());
        }
        self.index += 1;
        Ok(Some(payload))
    }
}

impl Iterator for RecordReader {
    type Item = PipelineResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// 圧縮出力の finish エラーを取りこぼさないためのライタ
#[must_use = "call .close() to propagate compression/IO errors"]
pub enum RecordWriter {
    Plain(BufWriter<File>),
    Gz(flate2::write::GzEncoder<BufWriter<File>>),
    Zlib(flate2::write::ZlibEncoder<BufWriter<File>>),
}

impl RecordWriter {
    pub fn create<P: AsRef<Path>>(path: P, compression: Compression) -> io::Result<Self> {
        let f = BufWriter::new(File::create(path.as_ref())?);
        let level = flate2::Compression::default();
        Ok(match compression {
            Compression::None => Self::Plain(f),
            Compression::Gzip => Self::Gz(flate2::write::GzEncoder::new(f, level)),
            Compression::Zlib => Self::Zlib(flate2::write::ZlibEncoder::new(f, level)),
        })
    }

    /// 1 レコードを書き込む
    pub fn write_record(&mut self, payload: &[u8]) -> io::Result<()> {
        let length = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record too large"))?;
        self.write_u32::<LittleEndian>(length)?;
        self.write_all(payload)
    }

    /// ストリームを確定してフラッシュ
    pub fn close(self) -> io::Result<()> {
        let buf = match self {
            Self::Plain(f) => f,
            Self::Gz(e) => e.finish()?,
            Self::Zlib(e) => e.finish()?,
        };
        let mut file = buf.into_inner().map_err(|e| e.into_error())?;
        file.flush()
    }
}

impl Write for RecordWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(f) => f.write(buf),
            Self::Gz(e) => e.write(buf),
            Self::Zlib(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(f) => f.flush(),
            Self::Gz(e) => e.flush(),
            Self::Zlib(e) => e.flush(),
        }
    }
}
