use flate2::read::GzDecoder;
use std::io::{self, Read};
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];

pub fn check_exists<P: AsRef<Path>>(path: &P) -> bool {
   path.as_ref().exists()
}

pub fn is_gzip(data: &[u8]) -> bool {
   data.starts_with(&GZIP_MAGIC)
}

pub fn is_zip(data: &[u8]) -> bool {
   data.starts_with(&ZIP_MAGIC)
}

pub fn decompress_gz(data: &[u8]) -> io::Result<Vec<u8>> {
   let mut decoder = GzDecoder::new(data);
   let mut buffer = Vec::new();
   decoder.read_to_end(&mut buffer)?;
   Ok(buffer)
}
