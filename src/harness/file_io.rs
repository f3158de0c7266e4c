//! Minimal synchronous realization of the file-I/O collaborator's contract
//! (`IOwrapper.h`): stream a file into, or out of, a `VortexC`'s arenas.
//! spec.md §1 marks the file-I/O helper itself as out of scope; this
//! implements only the `GetWriteBuf`/`GetReadBuf`/`FinishedWrite` surface
//! it consumes (spec.md §6), not the original's Windows overlapped-I/O
//! engine.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::thread;

use crate::error::Result;
use crate::stream::{Stream, VortexC, VortexCConfig};

const BLOCK_SIZE_POWER: u32 = 20;

/// `c src dst`: reads `src` into a `VortexC`'s writer arena on one thread,
/// drains the reader arena to `dst` on another.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    let size = std::fs::metadata(src)?.len();
    let vc = VortexC::new(VortexCConfig {
        size,
        block_size_power: BLOCK_SIZE_POWER,
        come_back_consumer: 4,
        come_back_producer: 4,
        write_ahead: 1,
    })?;

    let src = src.to_path_buf();
    let dst = dst.to_path_buf();

    let producer = {
        let vc = vc.clone();
        thread::spawn(move || -> Result<()> {
            let mut file = File::open(&src)?;
            let buf = unsafe { std::slice::from_raw_parts_mut(vc.get_write_buf(), size as usize) };
            file.read_exact(buf)?;
            vc.finished_write();
            Ok(())
        })
    };

    let consumer = {
        let vc = vc.clone();
        thread::spawn(move || -> Result<()> {
            let mut file = File::create(&dst)?;
            let buf = unsafe { std::slice::from_raw_parts(vc.get_read_buf(), size as usize) };
            file.write_all(buf)?;
            vc.finished_read();
            Ok(())
        })
    };

    producer.join().expect("producer thread panicked")?;
    consumer.join().expect("consumer thread panicked")?;
    vc.reset();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn copies_file_contents_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");

        let mut contents = vec![0u8; 1 << 16];
        for (i, b) in contents.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        File::create(&src).unwrap().write_all(&contents).unwrap();

        copy_file(&src, &dst).unwrap();

        let copied = std::fs::read(&dst).unwrap();
        assert_eq!(copied, contents);
    }
}
