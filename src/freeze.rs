//! Relocatable 'freeze' / 'thaw' serialization of value graphs.
//!
//! Freezing flattens a value and everything it owns into a single buffer in which all internal
//!  references are relative to the buffer, so the buffer can be copied or sent over the wire as
//!  is. Thawing validates such a buffer and returns a typed view into it *without* copying or
//!  allocating.
//!
//! The heavy lifting is done by `rkyv`: every type deriving `rkyv::Archive` and
//!  `rkyv::Serialize` (with `#[archive(check_bytes)]` for validation) is [Freeze] automatically.
//!
//! Buffers must be 16 byte aligned for thawing, which is why messages hold their payload in an
//!  [AlignedVec].

use std::any::type_name;
use std::convert::Infallible;

use anyhow::{anyhow, bail};
use rkyv::bytecheck::CheckBytes;
use rkyv::ser::serializers::{AlignedSerializer, AllocScratch, CompositeSerializer, FallbackScratch, HeapScratch, SharedSerializeMap};
use rkyv::ser::Serializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, Archived, Deserialize, Fallible, Serialize};

const SCRATCH_SIZE: usize = 1024;

type Scratch = FallbackScratch<HeapScratch<SCRATCH_SIZE>, AllocScratch>;

/// the serializer used for actually writing frozen values
pub type FreezeSerializer = CompositeSerializer<AlignedSerializer<AlignedVec>, Scratch, SharedSerializeMap>;

/// the serializer used for calculating a frozen value's size without writing anything
pub type SizingSerializer = CompositeSerializer<SizeCounter, Scratch, SharedSerializeMap>;


/// A serializer 'sink' that just keeps track of how many bytes would have been written. Running
///  the regular serialization logic against it yields the exact frozen size, including
///  alignment padding.
#[derive(Debug, Default)]
pub struct SizeCounter {
    pos: usize,
}

impl Fallible for SizeCounter {
    type Error = Infallible;
}

impl Serializer for SizeCounter {
    fn pos(&self) -> usize {
        self.pos
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.pos += bytes.len();
        Ok(())
    }
}


/// The freeze / thaw contract that all RPC payloads and reduction values are shipped through.
///
/// * [Freeze::frozen_size] returns the exact number of bytes [Freeze::freeze_into] will write
/// * [Freeze::freeze_into] writes the value into an empty buffer
/// * [Freeze::thaw] validates a frozen buffer and returns a zero-copy view of the value
pub trait Freeze: Archive + Send + Sync + 'static {
    fn frozen_size(&self) -> anyhow::Result<usize>;

    fn freeze_into(&self, buf: &mut AlignedVec) -> anyhow::Result<()>;

    fn thaw(buf: &[u8]) -> anyhow::Result<&Archived<Self>>;
}

impl <T> Freeze for T
where
    T: Archive + Serialize<FreezeSerializer> + Serialize<SizingSerializer> + Send + Sync + 'static,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>>,
{
    fn frozen_size(&self) -> anyhow::Result<usize> {
        let mut serializer = SizingSerializer::default();
        serializer.serialize_value(self)
            .map_err(|e| anyhow!("error calculating frozen size of {}: {:?}", type_name::<T>(), e))?;
        Ok(serializer.pos())
    }

    fn freeze_into(&self, buf: &mut AlignedVec) -> anyhow::Result<()> {
        if !buf.is_empty() {
            bail!("freezing {} into a buffer that is not empty", type_name::<T>());
        }

        let expected_len = buf.capacity();
        let target = std::mem::replace(buf, AlignedVec::new());

        let mut serializer = FreezeSerializer::new(
            AlignedSerializer::new(target),
            Scratch::default(),
            SharedSerializeMap::default(),
        );
        serializer.serialize_value(self)
            .map_err(|e| anyhow!("error freezing {}: {:?}", type_name::<T>(), e))?;
        *buf = serializer.into_serializer().into_inner();

        if buf.len() > expected_len {
            bail!("frozen {} has {} bytes, exceeding the buffer's {} bytes", type_name::<T>(), buf.len(), expected_len);
        }
        Ok(())
    }

    fn thaw(buf: &[u8]) -> anyhow::Result<&Archived<T>> {
        rkyv::check_archived_root::<T>(buf)
            .map_err(|_| anyhow!("buffer of {} bytes is not a valid frozen {}", buf.len(), type_name::<T>()))
    }
}

/// Convenience for freezing a value into a freshly allocated buffer of exactly the right size
pub fn freeze<T: Freeze>(value: &T) -> anyhow::Result<AlignedVec> {
    let mut buf = AlignedVec::with_capacity(value.frozen_size()?);
    value.freeze_into(&mut buf)?;
    Ok(buf)
}


/// Thawing into an owned copy, for callers that need the value to outlive its buffer.
pub trait ThawOwned: Freeze + Sized {
    fn thaw_owned(buf: &[u8]) -> anyhow::Result<Self>;
}

impl <T: Freeze> ThawOwned for T
where
    Archived<T>: Deserialize<T, rkyv::Infallible>,
{
    fn thaw_owned(buf: &[u8]) -> anyhow::Result<T> {
        let archived = T::thaw(buf)?;
        match archived.deserialize(&mut rkyv::Infallible) {
            Ok(value) => Ok(value),
            Err(e) => match e {},
        }
    }
}
