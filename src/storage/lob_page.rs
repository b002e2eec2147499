//! # Large-Object Pages
//!
//! Column values at or above the out-of-row threshold are chunked into
//! [`DataObject`] records spread across large-object pages. Each record
//! carries the address of the next record in its chain; a `next_page_id` of
//! zero terminates the chain (page 0 is the catalog and can never hold a
//! record). The row itself keeps only a 6-byte pointer to the chain head.
//!
//! ## Record Layout
//!
//! ```text
//! Offset  Size  Field              Description
//! ------  ----  -----------------  -----------------------------------
//! 0       4     object_size        Payload bytes in this record
//! 4       4     next_page_id       Page of the next record, 0 = terminal
//! 8       2     next_object_index  Slot of the next record in that page
//! 10      n     payload            Raw value bytes
//! ```
//!
//! Chains are written tail-first so every record already knows its
//! successor's address when it is placed; reconstruction walks head to tail
//! concatenating payloads.

use eyre::{ensure, Result};

use crate::config::{LOB_RECORD_HEADER_SIZE, PAGE_HEADER_SIZE};
use crate::storage::page::{PageHeader, PageKind};

/// One chunk of an out-of-row value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataObject {
    data: Vec<u8>,
    next_page_id: u32,
    next_object_index: u16,
}

impl DataObject {
    /// A record continuing at `next`, or terminal when `next_page_id` is 0.
    pub fn new(data: Vec<u8>, next_page_id: u32, next_object_index: u16) -> Self {
        Self {
            data,
            next_page_id,
            next_object_index,
        }
    }

    pub fn terminal(data: Vec<u8>) -> Self {
        Self::new(data, 0, 0)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn next_page_id(&self) -> u32 {
        self.next_page_id
    }

    pub fn next_object_index(&self) -> u16 {
        self.next_object_index
    }

    pub fn is_terminal(&self) -> bool {
        self.next_page_id == 0
    }

    /// On-page size of this record including its header.
    pub fn record_size(&self) -> usize {
        LOB_RECORD_HEADER_SIZE + self.data.len()
    }
}

#[derive(Debug, Clone)]
pub struct LobPage {
    header: PageHeader,
    objects: Vec<DataObject>,
}

impl LobPage {
    pub fn new(page_id: u32) -> Self {
        Self {
            header: PageHeader::new(page_id, PageKind::LargeObject),
            objects: Vec::new(),
        }
    }

    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    pub fn page_id(&self) -> u32 {
        self.header.page_id()
    }

    pub fn bytes_left(&self) -> usize {
        self.header.bytes_left() as usize
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn object(&self, index: u16) -> Result<&DataObject> {
        self.objects.get(index as usize).ok_or_else(|| {
            eyre::eyre!(
                "page {} has {} objects, no index {}",
                self.page_id(),
                self.objects.len(),
                index
            )
        })
    }

    /// Appends a record, returning its object index within this page.
    pub fn insert_object(&mut self, object: DataObject) -> Result<u16> {
        let size = object.record_size();
        ensure!(
            size <= self.bytes_left(),
            "object record of {} bytes does not fit in page {} ({} bytes left)",
            size,
            self.page_id(),
            self.bytes_left()
        );
        let index = self.objects.len() as u16;
        self.objects.push(object);
        self.header.set_item_count(self.objects.len() as u16);
        self.header
            .set_bytes_left((self.bytes_left() - size) as u16);
        Ok(index)
    }

    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        self.header.write_to(buf)?;
        let mut offset = PAGE_HEADER_SIZE;
        for object in &self.objects {
            let size = object.record_size();
            ensure!(
                offset + size <= buf.len(),
                "object record of {} bytes does not fit at offset {}",
                size,
                offset
            );
            buf[offset..offset + 4].copy_from_slice(&(object.data.len() as u32).to_le_bytes());
            buf[offset + 4..offset + 8].copy_from_slice(&object.next_page_id.to_le_bytes());
            buf[offset + 8..offset + 10].copy_from_slice(&object.next_object_index.to_le_bytes());
            offset += LOB_RECORD_HEADER_SIZE;
            buf[offset..offset + object.data.len()].copy_from_slice(&object.data);
            offset += object.data.len();
        }
        Ok(())
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let header = *PageHeader::from_bytes(buf)?;
        ensure!(
            header.kind() == PageKind::LargeObject,
            "page {} is {:?}, expected LargeObject",
            header.page_id(),
            header.kind()
        );

        let mut offset = PAGE_HEADER_SIZE;
        let mut objects = Vec::with_capacity(header.item_count() as usize);
        for _ in 0..header.item_count() {
            ensure!(
                offset + LOB_RECORD_HEADER_SIZE <= buf.len(),
                "object record header truncated at offset {}",
                offset
            );
            let size =
                u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("length checked"))
                    as usize;
            let next_page_id =
                u32::from_le_bytes(buf[offset + 4..offset + 8].try_into().expect("length checked"));
            let next_object_index = u16::from_le_bytes(
                buf[offset + 8..offset + 10].try_into().expect("length checked"),
            );
            offset += LOB_RECORD_HEADER_SIZE;
            ensure!(
                offset + size <= buf.len(),
                "object payload of {} bytes truncated at offset {}",
                size,
                offset
            );
            objects.push(DataObject::new(
                buf[offset..offset + size].to_vec(),
                next_page_id,
                next_object_index,
            ));
            offset += size;
        }

        Ok(Self { header, objects })
    }
}
