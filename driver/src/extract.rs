// Licensed under the Apache-2.0 license

//! Ring-buffer extraction engine
//!
//! Pulls whole sample elements out of the firmware-maintained circular
//! buffers ("tanks") without racing the producer. The engine works from
//! a descriptor snapshot the caller reads out of the firmware state
//! block; all arithmetic is forward circular distance, so a stale
//! snapshot can under-report but never reads past the producer.
//!
//! Producer and consumer pointers are wrapped addresses. A pointer equal
//! to the reference point means empty; a full buffer is only ever
//! reported through the descriptor's sample-reset flag, which starts the
//! read at the buffer base with the whole buffer available.
//!
//! Audio tanks carry a parallel annotation ring with one fixed-size
//! record per element. Annotated extraction reads the raw samples first,
//! then interleaves the annotations in place from the highest element
//! down, staging device reads through a session-owned window so no
//! element is overwritten before it has been moved.

use crate::error::{Error, Result};
use aoncore_bus::{BusTransport, MemoryRegion};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Per-element metadata record in an annotation ring.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Annotation {
    /// Tank pointer at the time the element was produced.
    pub tank_ptr: u32,
    pub src: u8,
    pub flags: u8,
    pub seq: u16,
}

pub const ANNOTATION_LEN: usize = core::mem::size_of::<Annotation>();

/// Annotation records fetched from the device per interleave batch.
const STAGING_RECORDS: usize = 64;

/// Which stream a tank belongs to. Each kind keeps its own private
/// last-read mark, so interleaved consumers never disturb each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Feature,
    Sensor,
    Accelerometer,
}

const STREAM_KINDS: usize = 4;

impl StreamKind {
    fn index(self) -> usize {
        match self {
            StreamKind::Audio => 0,
            StreamKind::Feature => 1,
            StreamKind::Sensor => 2,
            StreamKind::Accelerometer => 3,
        }
    }
}

/// Where an extraction starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractPolicy {
    /// The single most recent element.
    Newest,
    /// Everything from the firmware consumer pointer forward.
    Oldest,
    /// Everything this session has not read yet.
    OldestUnread,
    /// Preroll ending at the tank pointer recorded when a match fired.
    AtMatch { end: u32 },
}

/// Snapshot of one firmware ring buffer.
#[derive(Debug, Clone, Copy)]
pub struct RingDescriptor {
    pub region: MemoryRegion,
    pub base: u32,
    /// Total ring bytes; a whole multiple of `stride`.
    pub size: u32,
    /// Bytes per element.
    pub stride: u32,
    pub producer: u32,
    pub consumer: u32,
    /// Parallel annotation ring base, when the tank carries one.
    pub annotation_base: Option<u32>,
    /// Firmware restarted this tank; the whole buffer is fresh.
    pub sample_reset: bool,
}

impl RingDescriptor {
    fn end(&self) -> Result<u32> {
        self.base.checked_add(self.size).ok_or(Error::Uninitialized)
    }

    /// A descriptor that fails these checks means the firmware state
    /// block it came from is not trustworthy.
    fn validate(&self) -> Result<()> {
        let end = self.end()?;
        if self.size == 0 || self.stride == 0 || self.size % self.stride != 0 {
            return Err(Error::Uninitialized);
        }
        for ptr in [self.producer, self.consumer] {
            if ptr < self.base || ptr >= end {
                return Err(Error::Uninitialized);
            }
        }
        Ok(())
    }

    fn elements(&self) -> u32 {
        self.size / self.stride
    }

    /// Forward circular distance from `from` to `to`, both relative.
    fn forward(&self, from: u32, to: u32) -> u32 {
        (to + self.size - from) % self.size
    }

    /// Step a relative offset backward through the ring.
    fn back(&self, from: u32, bytes: u32) -> u32 {
        (from + self.size - bytes % self.size) % self.size
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractDiagnostics {
    pub extractions: u32,
    pub exhausted: u32,
}

/// The extraction engine. One per session; `reset` when firmware is
/// reloaded and every mark becomes meaningless.
pub struct Extractor {
    /// Relative last-read offset per stream kind.
    last_read: [Option<u32>; STREAM_KINDS],
    staging: [u8; STAGING_RECORDS * ANNOTATION_LEN],
    diagnostics: ExtractDiagnostics,
}

impl Extractor {
    pub fn new() -> Self {
        Extractor {
            last_read: [None; STREAM_KINDS],
            staging: [0; STAGING_RECORDS * ANNOTATION_LEN],
            diagnostics: ExtractDiagnostics::default(),
        }
    }

    /// Forget every last-read mark.
    pub fn reset(&mut self) {
        self.last_read = [None; STREAM_KINDS];
    }

    pub fn diagnostics(&self) -> ExtractDiagnostics {
        self.diagnostics
    }

    /// Copy whole elements into `out` per `policy`. Returns the bytes
    /// written: a multiple of the element stride, plus one annotation
    /// record per element when the tank is annotated. `Exhausted` means
    /// nothing whole is available right now, or `out` cannot hold even
    /// one element; both are retryable.
    pub fn extract(
        &mut self,
        bus: &mut dyn BusTransport,
        ring: &RingDescriptor,
        kind: StreamKind,
        policy: ExtractPolicy,
        out: &mut [u8],
    ) -> Result<usize> {
        ring.validate()?;
        let stride = ring.stride as usize;
        let unit = if ring.annotation_base.is_some() {
            stride + ANNOTATION_LEN
        } else {
            stride
        };
        let capacity = (out.len() / unit) as u32;

        let producer_rel = ring.producer - ring.base;
        let consumer_rel = ring.consumer - ring.base;
        let (start_rel, count) = match policy {
            ExtractPolicy::Newest => {
                let available = if ring.sample_reset {
                    ring.size
                } else {
                    ring.forward(consumer_rel, producer_rel)
                };
                if available < ring.stride {
                    return Err(self.exhausted());
                }
                (ring.back(producer_rel, ring.stride), capacity.min(1))
            }
            ExtractPolicy::Oldest | ExtractPolicy::OldestUnread => {
                let mark = match policy {
                    ExtractPolicy::OldestUnread => self.last_read[kind.index()],
                    _ => None,
                };
                let (reference, available) = if ring.sample_reset {
                    (0, ring.size)
                } else {
                    let reference = mark.unwrap_or(consumer_rel);
                    (reference, ring.forward(reference, producer_rel))
                };
                (reference, capacity.min(available / ring.stride))
            }
            ExtractPolicy::AtMatch { end } => {
                if end < ring.base || end >= ring.end()? {
                    return Err(Error::Uninitialized);
                }
                let count = capacity.min(ring.elements());
                (ring.back(end - ring.base, count * ring.stride), count)
            }
        };
        if count == 0 {
            return Err(self.exhausted());
        }

        let sample_bytes = (count * ring.stride) as usize;
        read_ring(
            bus,
            ring.region,
            ring.base,
            ring.size,
            start_rel,
            &mut out[..sample_bytes],
        )?;
        if let Some(annotation_base) = ring.annotation_base {
            self.interleave(
                bus,
                ring,
                annotation_base,
                start_rel / ring.stride,
                count as usize,
                out,
            )?;
        }

        let end_rel = (start_rel + sample_bytes as u32) % ring.size;
        self.last_read[kind.index()] = Some(end_rel);
        self.diagnostics.extractions += 1;
        log::debug!(
            "extract {:?} {:?}: {} elements from 0x{:x}",
            kind,
            policy,
            count,
            ring.base + start_rel
        );
        Ok((count as usize) * unit)
    }

    /// Spread `count` raw elements at the front of `out` into
    /// element+annotation pairs. Walks from the highest element down:
    /// element moves land at or past every untouched source, and the
    /// annotations come from the staging window, never from `out`.
    fn interleave(
        &mut self,
        bus: &mut dyn BusTransport,
        ring: &RingDescriptor,
        annotation_base: u32,
        start_index: u32,
        count: usize,
        out: &mut [u8],
    ) -> Result<()> {
        let stride = ring.stride as usize;
        let elements = ring.elements();
        let annotation_size = elements * ANNOTATION_LEN as u32;
        let mut hi = count;
        while hi > 0 {
            let lo = hi.saturating_sub(STAGING_RECORDS);
            let batch = hi - lo;
            let first = (start_index + lo as u32) % elements;
            read_ring(
                bus,
                ring.region,
                annotation_base,
                annotation_size,
                first * ANNOTATION_LEN as u32,
                &mut self.staging[..batch * ANNOTATION_LEN],
            )?;
            for i in (lo..hi).rev() {
                let src = i * stride;
                let dst = i * (stride + ANNOTATION_LEN);
                out.copy_within(src..src + stride, dst);
                let a = (i - lo) * ANNOTATION_LEN;
                out[dst + stride..dst + stride + ANNOTATION_LEN]
                    .copy_from_slice(&self.staging[a..a + ANNOTATION_LEN]);
            }
            hi = lo;
        }
        Ok(())
    }

    fn exhausted(&mut self) -> Error {
        self.diagnostics.exhausted += 1;
        Error::Exhausted
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Extractor::new()
    }
}

/// One logical ring read, split into two transfers when it crosses the
/// physical end of the buffer.
fn read_ring(
    bus: &mut dyn BusTransport,
    region: MemoryRegion,
    base: u32,
    size: u32,
    rel: u32,
    out: &mut [u8],
) -> Result<()> {
    let first = out.len().min((size - rel) as usize);
    bus.read(region, base + rel, &mut out[..first])?;
    if first < out.len() {
        bus.read(region, base, &mut out[first..])?;
    }
    Ok(())
}
