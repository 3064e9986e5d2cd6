use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use crate::prelude::*;

/// Transfer block size for reassembling multi-part dumps.
pub const JOIN_BLOCK_SIZE: usize = 4160;

/// Concatenate `parts` into `target` using fixed-size block copies with
/// an accumulating byte offset. Every part must be a whole number of
/// blocks: an irregular final block aborts the join and deletes the
/// partial output rather than producing a corrupt artifact. Returns the
/// total number of bytes written.
pub fn join_parts(parts: &[impl AsRef<Path>], target: &Path) -> Result<u64> {
    let mut output = File::create(target)
        .with_context(|| format!("failed to create joined dump {}", target.display()))?;
    let mut total: u64 = 0;
    let mut block = vec![0u8; JOIN_BLOCK_SIZE];

    for part in parts {
        let part = part.as_ref();
        let mut input = File::open(part)
            .with_context(|| format!("failed to open dump part {}", part.display()))?;
        loop {
            let read = read_block(&mut input, &mut block)
                .with_context(|| format!("failed to read dump part {}", part.display()))?;
            if read == 0 {
                break;
            }
            if read != JOIN_BLOCK_SIZE {
                drop(output);
                fs::remove_file(target).with_context(|| {
                    format!("failed to remove partial join output {}", target.display())
                })?;
                bail!(
                    "dump part {} ends with an irregular {read}-byte block at offset {total}",
                    part.display()
                );
            }
            output
                .write_all(&block)
                .with_context(|| format!("failed to write joined dump {}", target.display()))?;
            total += read as u64;
        }
    }
    Ok(total)
}

/// Fill `block` from `input`, tolerating short reads. Returns the number
/// of bytes read, which is less than the block size only at end of file.
fn read_block(input: &mut File, block: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < block.len() {
        let read = input.read(&mut block[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
