use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::*;
use std::io::{Read, Write};

use crate::rbtrfs_lib::utils::sector_align;
use crate::rbtrfs_lib::{FsError, FsResult};

pub fn zlib_compress(data: &[u8], level: u32) -> FsResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data).map_err(|_| FsError::OutOfMemory)?;
    encoder.finish().map_err(|_| FsError::OutOfMemory)
}

pub fn zlib_decompress(data: &[u8], decoded_size: usize) -> FsResult<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(decoded_size);
    decoder
        .read_to_end(&mut out)
        .map_err(|_| FsError::Corrupted("zlib stream does not decompress"))?;
    if out.len() != decoded_size {
        return Err(FsError::Corrupted("decompressed length mismatch"));
    }
    Ok(out)
}

/// Try compressing one extent block. Returns the compressed bytes padded to a
/// whole number of sectors, or None when compression does not save at least
/// one sector.
pub fn compress_bit(data: &[u8], level: u32, sector_size: u64) -> FsResult<Option<Vec<u8>>> {
    let compressed = zlib_compress(data, level)?;
    let padded = sector_align(compressed.len() as u64, sector_size);
    if padded >= sector_align(data.len() as u64, sector_size) {
        trace!("block incompressible ({} -> {})", data.len(), compressed.len());
        return Ok(None);
    }
    let mut out = compressed;
    out.resize(padded as usize, 0);
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn compressible_round_trip() {
        let data = vec![0x41 as u8; 0x20000];
        let comp = compress_bit(&data, 3, 4096).unwrap().unwrap();
        assert!(comp.len() < data.len());
        assert_eq!(comp.len() % 4096, 0);
        let plain = zlib_decompress(&comp, data.len()).unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn random_data_is_incompressible() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let data: Vec<u8> = (0..0x20000).map(|_| rng.gen()).collect();
        assert!(compress_bit(&data, 3, 4096).unwrap().is_none());
    }

    #[test]
    fn truncated_stream_is_corrupt() {
        let data = vec![7 as u8; 8192];
        let comp = zlib_compress(&data, 3).unwrap();
        assert!(matches!(
            zlib_decompress(&comp[..comp.len() / 2], data.len()),
            Err(FsError::Corrupted(_))
        ));
    }
}
