//! File functions
//!
//! The file has the following structure
//!
//! Header
//!   [Block]
//! Footer
//!
//! The Header contains the format version and the offset of the Footer.
//! Each stored object lives in its own Block.
//! The Footer contains:
//!   BlockMap associates an object reference with a Block `HashMap<u64, Block>`
//!   Blocks are the free blocks of the file. `VecDeque<Block>`
//!   Catalog holds committed datatypes, attributes and root links.
//!
//! The whole file is loaded into memory when opened and written back on flush.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Result;
use bincode::Options;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::container::{
    Address, Attribute, Container, ContainerError, ObjRef, StoredObject,
};
use super::memory::{Catalog, MemoryContainer};
use crate::codec::Datatype;
use crate::BINCODER;

const BLOCK_SIZE: u64 = 512;

const INITIAL_SIZE: u64 = 64 * BLOCK_SIZE;

const FORMAT_VERSION_1: u8 = 1;

const SUPPORTED_VERSIONS: &[u8] = &[FORMAT_VERSION_1];

/// A container persisted in a block file.
#[derive(Debug)]
pub struct ContainerFile {
    path: PathBuf,
    blocks: BlockFile,
    image: MemoryContainer,
    modified: bool,
}

#[derive(Debug)]
struct BlockFile {
    file: File,
    header: FileHeader,
    footer: FileFooter,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileFooter {
    map_size: u64,
    block_map: HashMap<u64, Block>,
    blocks_size: u64,
    blocks: VecDeque<Block>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileHeader {
    version: u8,
    footer_offset: u64,
}

/// A Block of storage
#[derive(Debug, Eq, Serialize, Deserialize)]
struct Block {
    /// Offset within file
    offset: u64,
    /// Number of BLOCK_SIZE chunks in block
    count: u64,
}

impl Block {
    fn split(&mut self, count: u64) -> Option<Block> {
        if count < self.count {
            let rem = Block {
                offset: self.offset + count * BLOCK_SIZE,
                count: self.count - count,
            };
            self.count = count;
            Some(rem)
        } else {
            None
        }
    }
}

impl Ord for Block {
    fn cmp(&self, other: &Self) -> Ordering {
        self.count.cmp(&other.count)
    }
}

impl PartialOrd for Block {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.count == other.count
    }
}

impl ContainerFile {
    /// Create a new, empty container file. An existing file at `path` is overwritten.
    pub async fn try_new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;

        let (header, block) = BlockFile::create_file_artifacts(INITIAL_SIZE);

        file.set_len(header.footer_offset).await?;

        let mut blocks = VecDeque::new();
        blocks.push_front(block);

        let block_map = HashMap::new();

        let footer = FileFooter {
            map_size: BINCODER.serialized_size(&block_map)?,
            block_map,
            blocks_size: BINCODER.serialized_size(&blocks)?,
            blocks,
        };

        tracing::info!("Created container file: {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            blocks: BlockFile {
                file,
                header,
                footer,
            },
            image: MemoryContainer::new(),
            modified: true,
        })
    }

    /// Open an existing container file and load it into memory.
    pub async fn try_open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)
            .await?;

        let header = BlockFile::read_header(&mut file).await?;

        if !SUPPORTED_VERSIONS.contains(&header.version) {
            return Err(ContainerError::InvalidFileVersion(header.version).into());
        }

        let (footer, catalog) = BlockFile::read_footer(&mut file, header.footer_offset).await?;

        let mut blocks = BlockFile {
            file,
            header,
            footer,
        };

        let mut indices: Vec<u64> = blocks.footer.block_map.keys().copied().collect();
        indices.sort_unstable();
        let mut objects = BTreeMap::new();
        for index in indices {
            let data = blocks.read_data(index).await?;
            let object: StoredObject = BINCODER.deserialize(&data)?;
            objects.insert(index, object);
        }

        tracing::info!(
            "Opened container file: {} ({} objects)",
            path.display(),
            objects.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            blocks,
            image: MemoryContainer::from_parts(catalog, objects),
            modified: false,
        })
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of objects stored.
    pub fn object_count(&self) -> usize {
        self.image.object_count()
    }

    /// Write objects changed since the last flush, then the header and footer.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.modified {
            return Ok(());
        }
        let dirty = self.image.take_dirty();
        tracing::debug!("Flushing {} objects to {}", dirty.len(), self.path.display());
        for (index, object) in dirty {
            let data = BINCODER.serialize(object)?;
            self.blocks.write_data(index, &data).await?;
        }
        self.blocks
            .write_header_and_footer(&self.image.catalog)
            .await?;
        self.blocks.file.sync_all().await?;
        self.modified = false;
        Ok(())
    }
}

impl BlockFile {
    async fn read_data(&mut self, index: u64) -> Result<Vec<u8>> {
        match self.footer.block_map.get(&index) {
            Some(block) => {
                let mut buf = vec![0; (BLOCK_SIZE * block.count) as usize];
                self.file.seek(SeekFrom::Start(block.offset)).await?;
                self.file.read_exact(&mut buf).await?;
                Ok(buf)
            }
            None => Err(ContainerError::LostMapping(index).into()),
        }
    }

    async fn write_data(&mut self, index: u64, data: &[u8]) -> Result<()> {
        // Somewhat unusual structure because we may have to migrate a data block
        let offset = match self.footer.block_map.get(&index) {
            Some(block) => {
                let count = BlockFile::blocks_needed(data.len() as u64);
                if count > block.count {
                    // Need to migrate
                    let new_block = self.get_block(data.len() as u64)?;
                    let offset = new_block.offset;
                    let old_block = self
                        .footer
                        .block_map
                        .insert(index, new_block)
                        .ok_or(ContainerError::BlockReturn(index))?;
                    // Return old block into blocks...
                    let pos = self
                        .footer
                        .blocks
                        .partition_point(|x| old_block.count <= x.count);
                    self.footer.blocks.insert(pos, old_block);
                    offset
                } else {
                    block.offset
                }
            }
            None => {
                let block = self.get_block(data.len() as u64)?;
                let offset = block.offset;
                self.footer.block_map.insert(index, block);
                offset
            }
        };
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn read_header(file: &mut File) -> Result<FileHeader> {
        let mut buf = vec![0; BLOCK_SIZE as usize];

        file.seek(SeekFrom::Start(0)).await?;
        file.read_exact(&mut buf).await?;

        BINCODER.deserialize(&buf).map_err(|e| e.into())
    }

    async fn read_sized(file: &mut File) -> Result<Vec<u8>> {
        let mut size_buf = vec![0; 8];
        file.read_exact(&mut size_buf).await?;
        let size: u64 = BINCODER.deserialize(&size_buf)?;

        let mut buf = vec![0; size as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn read_footer(file: &mut File, offset: u64) -> Result<(FileFooter, Catalog)> {
        file.seek(SeekFrom::Start(offset)).await?;

        let block_map = BINCODER.deserialize(&BlockFile::read_sized(file).await?)?;
        let blocks = BINCODER.deserialize(&BlockFile::read_sized(file).await?)?;
        let catalog = BINCODER.deserialize(&BlockFile::read_sized(file).await?)?;

        let footer = FileFooter {
            map_size: BINCODER.serialized_size(&block_map)?,
            block_map,
            blocks_size: BINCODER.serialized_size(&blocks)?,
            blocks,
        };
        Ok((footer, catalog))
    }

    async fn write_header_and_footer(&mut self, catalog: &Catalog) -> Result<()> {
        let s_header = BINCODER.serialize(&self.header)?;
        self.file.seek(SeekFrom::Start(0)).await?;
        self.file.write_all(&s_header).await?;

        let s_map = BINCODER.serialize(&self.footer.block_map)?;
        let s_blocks = BINCODER.serialize(&self.footer.blocks)?;
        let s_catalog = BINCODER.serialize(catalog)?;
        self.footer.map_size = s_map.len() as u64;
        self.footer.blocks_size = s_blocks.len() as u64;
        let s_map_size = BINCODER.serialize(&self.footer.map_size)?;
        let s_blocks_size = BINCODER.serialize(&self.footer.blocks_size)?;
        let s_catalog_size = BINCODER.serialize(&(s_catalog.len() as u64))?;
        self.file
            .seek(SeekFrom::Start(self.header.footer_offset))
            .await?;

        self.file.write_all(&s_map_size).await?;
        self.file.write_all(&s_map).await?;
        self.file.write_all(&s_blocks_size).await?;
        self.file.write_all(&s_blocks).await?;
        self.file.write_all(&s_catalog_size).await?;
        self.file.write_all(&s_catalog).await?;

        // A shrinking catalog must not leave a stale tail behind
        let end = self.file.stream_position().await?;
        self.file.set_len(end).await?;

        Ok(())
    }

    /// Initialise our file structure based on desired storage space
    fn create_file_artifacts(size: u64) -> (FileHeader, Block) {
        let count = BlockFile::blocks_needed(size);

        // Add on a block to store the header in
        let hdr = FileHeader {
            version: FORMAT_VERSION_1,
            footer_offset: (count + 1) * BLOCK_SIZE,
        };

        let block = Block {
            offset: BLOCK_SIZE,
            count,
        };

        (hdr, block)
    }

    fn blocks_needed(size: u64) -> u64 {
        size.div_ceil(BLOCK_SIZE).max(1)
    }

    /// Get (or allocate) a block to write with
    fn get_block(&mut self, size: u64) -> Result<Block> {
        // Search our list of existing blocks to find a block that is >= required size (in bytes).
        // If we can't find a block, we need to expand our file, pushing the footer along.
        let count = BlockFile::blocks_needed(size);
        let mut pos = self.footer.blocks.partition_point(|x| count <= x.count);
        if pos == 0 {
            let block = Block {
                offset: self.header.footer_offset,
                count,
            };
            self.header.footer_offset += block.count * BLOCK_SIZE;
            self.footer.blocks.push_front(block);
            pos = self.footer.blocks.partition_point(|x| count <= x.count);
        }
        // Take 1 away from pos to get the last valid value (that's what we are looking for)
        pos -= 1;
        // At this point, pos must be a valid value. Let's split that block and then re-insert it
        self.footer
            .blocks
            .remove(pos)
            .map(|mut block| {
                let rem_opt = block.split(count);
                if let Some(rem) = rem_opt {
                    let pos = self.footer.blocks.partition_point(|x| rem.count <= x.count);
                    self.footer.blocks.insert(pos, rem);
                }
                block
            })
            .ok_or(ContainerError::LostBlock(pos).into())
    }
}

impl Container for ContainerFile {
    fn commit(&mut self, namespace: &str, name: &str, datatype: &Datatype) -> Result<Address> {
        self.modified = true;
        self.image.commit(namespace, name, datatype)
    }

    fn datatype(&self, address: Address) -> Result<Datatype> {
        self.image.datatype(address)
    }

    fn enumerate(&self, namespace: &str) -> Result<Vec<(String, Address)>> {
        self.image.enumerate(namespace)
    }

    fn read_attribute(&self, address: Address, key: &str) -> Result<Option<Attribute>> {
        self.image.read_attribute(address, key)
    }

    fn write_attribute(&mut self, address: Address, key: &str, value: Attribute) -> Result<()> {
        self.modified = true;
        self.image.write_attribute(address, key, value)
    }

    fn reserve_object(&mut self) -> ObjRef {
        self.modified = true;
        self.image.reserve_object()
    }

    fn write_object(&mut self, reference: ObjRef, object: StoredObject) -> Result<()> {
        self.modified = true;
        self.image.write_object(reference, object)
    }

    fn read_object(&self, reference: ObjRef) -> Result<StoredObject> {
        self.image.read_object(reference)
    }

    fn link(&mut self, name: &str, reference: ObjRef) -> Result<()> {
        self.modified = true;
        self.image.link(name, reference)
    }

    fn lookup(&self, name: &str) -> Option<ObjRef> {
        self.image.lookup(name)
    }

    fn links(&self) -> Vec<(String, ObjRef)> {
        self.image.links()
    }
}

impl Drop for ContainerFile {
    fn drop(&mut self) {
        if !self.modified {
            return;
        }
        std::thread::scope(|s| {
            let hdl = s.spawn(|| {
                let runtime = match tokio::runtime::Builder::new_current_thread().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::warn!("could not flush container file to disk: {}", e);
                        return;
                    }
                };
                if let Err(e) = runtime.block_on(self.flush()) {
                    tracing::warn!("could not flush container file to disk: {}", e);
                }
            });
            if hdl.join().is_err() {
                tracing::warn!("container file flush panicked");
            }
        });
    }
}
