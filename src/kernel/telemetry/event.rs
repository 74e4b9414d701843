//! Wire-level event catalogue.
//!
//! Every record occupies one fixed-size ring slot of `RECORD_WORDS` little
//! endian 64-bit words. Byte 0 of word 0 is the event type; the remainder of
//! word 0 carries small enum and index fields, and the payload follows.
//! Unused words are always zero.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TrackerError;

pub const RECORD_WORDS: usize = 8;
pub const RECORD_BYTES: usize = RECORD_WORDS * std::mem::size_of::<u64>();
pub const EVENT_TYPE_COUNT: usize = 64;

/// Declares a one-byte wire enum with lossless decoding.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn from_wire(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            #[inline]
            pub fn wire(self) -> u8 {
                self as u8
            }
        }
    };
}

wire_enum!(
    /// Discriminant of a ring record and index into every per-type table.
    EventType {
        Invalid = 0,
        MemoryAlloc = 1,
        MemoryFree = 2,
        MemoryViolation = 3,
        CpuFault = 4,
        Migration = 5,
        GpuFault = 6,
        GpuFaultReplay = 7,
        FaultBufferOverflow = 8,
        FatalFault = 9,
        ReadDuplicate = 10,
        ReadDuplicateInvalidate = 11,
        PageSizeChange = 12,
        ThrashingDetected = 13,
        ThrottlingStart = 14,
        ThrottlingEnd = 15,
        MapRemote = 16,
        Eviction = 17,
        TestAccessCounter = 62,
        TestHmmSplitInvalidate = 63,
    }
);

impl EventType {
    /// One past the last regular type.
    pub const REGULAR_END: u8 = 18;
    pub const TEST_FIRST: u8 = 62;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn bit(self) -> u64 {
        1u64 << self.index()
    }

    pub fn is_test(self) -> bool {
        self.wire() >= Self::TEST_FIRST
    }
}

wire_enum!(MigrationCause {
    Invalid = 0,
    User = 1,
    Coherence = 2,
    Prefetch = 3,
    Eviction = 4,
    AccessCounters = 5,
});

wire_enum!(MemoryAccessType {
    Invalid = 0,
    Read = 1,
    Write = 2,
    Atomic = 3,
    Prefetch = 4,
});

wire_enum!(FaultType {
    Invalid = 0,
    InvalidPde = 1,
    InvalidPte = 2,
    Write = 3,
    Atomic = 4,
    InvalidPdeSize = 5,
    LimitViolation = 6,
    UnboundInstBlock = 7,
    PrivViolation = 8,
    PitchMaskViolation = 9,
    WorkCreation = 10,
    UnsupportedAperture = 11,
    CompressionFailure = 12,
    UnsupportedKind = 13,
    RegionViolation = 14,
    Poison = 15,
});

wire_enum!(FaultClientType {
    Invalid = 0,
    Gpc = 1,
    Hub = 2,
});

wire_enum!(FatalReason {
    Invalid = 0,
    InvalidAddress = 1,
    InvalidPermissions = 2,
    InvalidFaultType = 3,
    OutOfMemory = 4,
    InternalError = 5,
    InvalidOperation = 6,
});

wire_enum!(MapRemoteCause {
    Invalid = 0,
    Coherence = 1,
    Thrashing = 2,
    Policy = 3,
    OutOfMemory = 4,
    Eviction = 5,
});

wire_enum!(Aperture {
    Invalid = 0,
    Peer0 = 1,
    Peer1 = 2,
    Peer2 = 3,
    Peer3 = 4,
    Peer4 = 5,
    Peer5 = 6,
    Peer6 = 7,
    Peer7 = 8,
    Sys = 9,
    Vid = 10,
});

/// Subscription mask over event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventMask(u64);

impl EventMask {
    /// Types 1..18. Bit 0 is `Invalid` and never legal.
    pub const REGULAR: u64 = ((1u64 << EventType::REGULAR_END) - 1) & !1;
    pub const TEST: u64 = (1u64 << 62) | (1u64 << 63);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, ty: EventType) -> bool {
        self.0 & ty.bit() != 0
    }

    pub fn with(self, ty: EventType) -> Self {
        Self(self.0 | ty.bit())
    }

    pub fn legal(test_mode: bool) -> u64 {
        if test_mode {
            Self::REGULAR | Self::TEST
        } else {
            Self::REGULAR
        }
    }

    /// Rejects any bit outside the legal set for the current mode.
    pub fn validate(bits: u64, test_mode: bool) -> Result<Self, TrackerError> {
        let legal = Self::legal(test_mode);
        if bits & !legal != 0 {
            if !test_mode && bits & Self::TEST != 0 {
                warn!(mask = bits, "event index not found, did you mean to enable builtin tests?");
            }
            return Err(TrackerError::InvalidMask { mask: bits, legal });
        }
        Ok(Self(bits))
    }

    /// Set bit indices in ascending order.
    pub fn indices(self) -> impl Iterator<Item = usize> {
        (0..EVENT_TYPE_COUNT).filter(move |i| self.0 & (1u64 << i) != 0)
    }
}

impl FromIterator<EventType> for EventMask {
    fn from_iter<I: IntoIterator<Item = EventType>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub src_index: u8,
    pub dst_index: u8,
    pub migration_cause: MigrationCause,
    pub address: u64,
    pub migrated_bytes: u64,
    pub begin_time_stamp: u64,
    pub end_time_stamp: u64,
    pub begin_time_stamp_gpu: u64,
    pub end_time_stamp_gpu: u64,
    pub range_group_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuFaultInfo {
    pub access_type: MemoryAccessType,
    pub preferred_location: u8,
    pub address: u64,
    pub time_stamp: u64,
    pub pid: u32,
    pub thread_id: u32,
    pub pc: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuFaultInfo {
    pub gpu_index: u8,
    pub fault_type: FaultType,
    pub access_type: MemoryAccessType,
    pub client_type: FaultClientType,
    pub gpc_id: u16,
    pub channel_id: u16,
    pub client_id: u16,
    pub address: u64,
    pub time_stamp: u64,
    pub time_stamp_gpu: u64,
    pub batch_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuFaultReplayInfo {
    pub gpu_index: u8,
    pub client_type: FaultClientType,
    pub batch_id: u32,
    pub time_stamp: u64,
    pub time_stamp_gpu: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalFaultInfo {
    pub processor_index: u8,
    pub access_type: MemoryAccessType,
    pub fault_type: FaultType,
    pub reason: FatalReason,
    pub address: u64,
    pub time_stamp: u64,
}

/// Shared by read-duplicate and thrashing-detected records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorSetInfo {
    pub processors: u64,
    pub address: u64,
    pub size: u64,
    pub time_stamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadDuplicateInvalidateInfo {
    pub resident_index: u8,
    pub address: u64,
    pub size: u64,
    pub time_stamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottlingInfo {
    pub processor_index: u8,
    pub address: u64,
    pub time_stamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRemoteInfo {
    pub src_index: u8,
    pub dst_index: u8,
    pub map_remote_cause: MapRemoteCause,
    pub address: u64,
    pub size: u64,
    pub time_stamp: u64,
    pub time_stamp_gpu: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCounterInfo {
    pub src_index: u8,
    pub aperture: Aperture,
    pub instance_ptr_aperture: Aperture,
    pub is_virtual: bool,
    pub is_from_cpu: bool,
    pub on_managed: bool,
    pub ve_id: u8,
    pub address: u64,
    pub instance_ptr: u64,
    pub value: u32,
    pub sub_granularity: u32,
    pub tag: u32,
    pub bank: u32,
}

/// One fully populated event, ready to be written into a ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventRecord {
    Migration(MigrationInfo),
    CpuFault(CpuFaultInfo),
    GpuFault(GpuFaultInfo),
    GpuFaultReplay(GpuFaultReplayInfo),
    FatalFault(FatalFaultInfo),
    ReadDuplicate(ProcessorSetInfo),
    ReadDuplicateInvalidate(ReadDuplicateInvalidateInfo),
    ThrashingDetected(ProcessorSetInfo),
    ThrottlingStart(ThrottlingInfo),
    ThrottlingEnd(ThrottlingInfo),
    MapRemote(MapRemoteInfo),
    TestAccessCounter(AccessCounterInfo),
    TestHmmSplitInvalidate,
}

#[inline]
fn header(ty: EventType, rest: [u8; 7]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[0] = ty.wire();
    bytes[1..].copy_from_slice(&rest);
    u64::from_le_bytes(bytes)
}

#[inline]
fn lo32(word: u64) -> u32 {
    word as u32
}

#[inline]
fn hi32(word: u64) -> u32 {
    (word >> 32) as u32
}

#[inline]
fn pair(lo: u32, hi: u32) -> u64 {
    lo as u64 | (hi as u64) << 32
}

impl EventRecord {
    pub fn event_type(&self) -> EventType {
        match self {
            EventRecord::Migration(_) => EventType::Migration,
            EventRecord::CpuFault(_) => EventType::CpuFault,
            EventRecord::GpuFault(_) => EventType::GpuFault,
            EventRecord::GpuFaultReplay(_) => EventType::GpuFaultReplay,
            EventRecord::FatalFault(_) => EventType::FatalFault,
            EventRecord::ReadDuplicate(_) => EventType::ReadDuplicate,
            EventRecord::ReadDuplicateInvalidate(_) => EventType::ReadDuplicateInvalidate,
            EventRecord::ThrashingDetected(_) => EventType::ThrashingDetected,
            EventRecord::ThrottlingStart(_) => EventType::ThrottlingStart,
            EventRecord::ThrottlingEnd(_) => EventType::ThrottlingEnd,
            EventRecord::MapRemote(_) => EventType::MapRemote,
            EventRecord::TestAccessCounter(_) => EventType::TestAccessCounter,
            EventRecord::TestHmmSplitInvalidate => EventType::TestHmmSplitInvalidate,
        }
    }

    /// Serializes into a zeroed slot image.
    pub fn encode(&self) -> [u64; RECORD_WORDS] {
        let mut w = [0u64; RECORD_WORDS];
        let ty = self.event_type();
        match self {
            EventRecord::Migration(m) => {
                w[0] = header(ty, [m.src_index, m.dst_index, m.migration_cause.wire(), 0, 0, 0, 0]);
                w[1] = m.address;
                w[2] = m.migrated_bytes;
                w[3] = m.begin_time_stamp;
                w[4] = m.end_time_stamp;
                w[5] = m.begin_time_stamp_gpu;
                w[6] = m.end_time_stamp_gpu;
                w[7] = m.range_group_id;
            }
            EventRecord::CpuFault(f) => {
                w[0] = header(ty, [f.access_type.wire(), f.preferred_location, 0, 0, 0, 0, 0]);
                w[1] = f.address;
                w[2] = f.time_stamp;
                w[3] = pair(f.pid, f.thread_id);
                w[4] = f.pc;
            }
            EventRecord::GpuFault(f) => {
                w[0] = header(
                    ty,
                    [
                        f.gpu_index,
                        f.fault_type.wire(),
                        f.access_type.wire(),
                        f.client_type.wire(),
                        0,
                        0,
                        0,
                    ],
                );
                w[1] = f.gpc_id as u64 | (f.channel_id as u64) << 16 | (f.client_id as u64) << 32;
                w[2] = f.address;
                w[3] = f.time_stamp;
                w[4] = f.time_stamp_gpu;
                w[5] = f.batch_id as u64;
            }
            EventRecord::GpuFaultReplay(r) => {
                let [b0, b1, b2, b3] = r.batch_id.to_le_bytes();
                w[0] = header(ty, [r.gpu_index, r.client_type.wire(), 0, b0, b1, b2, b3]);
                w[1] = r.time_stamp;
                w[2] = r.time_stamp_gpu;
            }
            EventRecord::FatalFault(f) => {
                w[0] = header(
                    ty,
                    [
                        f.processor_index,
                        f.access_type.wire(),
                        f.fault_type.wire(),
                        f.reason.wire(),
                        0,
                        0,
                        0,
                    ],
                );
                w[1] = f.address;
                w[2] = f.time_stamp;
            }
            EventRecord::ReadDuplicate(p) | EventRecord::ThrashingDetected(p) => {
                w[0] = header(ty, [0; 7]);
                w[1] = p.processors;
                w[2] = p.address;
                w[3] = p.size;
                w[4] = p.time_stamp;
            }
            EventRecord::ReadDuplicateInvalidate(r) => {
                w[0] = header(ty, [r.resident_index, 0, 0, 0, 0, 0, 0]);
                w[1] = r.address;
                w[2] = r.size;
                w[3] = r.time_stamp;
            }
            EventRecord::ThrottlingStart(t) | EventRecord::ThrottlingEnd(t) => {
                w[0] = header(ty, [t.processor_index, 0, 0, 0, 0, 0, 0]);
                w[1] = t.address;
                w[2] = t.time_stamp;
            }
            EventRecord::MapRemote(m) => {
                w[0] = header(ty, [m.src_index, m.dst_index, m.map_remote_cause.wire(), 0, 0, 0, 0]);
                w[1] = m.address;
                w[2] = m.size;
                w[3] = m.time_stamp;
                w[4] = m.time_stamp_gpu;
            }
            EventRecord::TestAccessCounter(a) => {
                w[0] = header(
                    ty,
                    [
                        a.src_index,
                        a.aperture.wire(),
                        a.instance_ptr_aperture.wire(),
                        a.is_virtual as u8,
                        a.is_from_cpu as u8,
                        a.on_managed as u8,
                        a.ve_id,
                    ],
                );
                w[1] = a.address;
                w[2] = a.instance_ptr;
                w[3] = pair(a.value, a.sub_granularity);
                w[4] = pair(a.tag, a.bank);
            }
            EventRecord::TestHmmSplitInvalidate => {
                w[0] = header(ty, [0; 7]);
            }
        }
        w
    }

    /// Parses a slot image. Returns `None` for unknown types or enum values.
    pub fn decode(w: &[u64; RECORD_WORDS]) -> Option<Self> {
        let b = w[0].to_le_bytes();
        let ty = EventType::from_wire(b[0])?;
        let record = match ty {
            EventType::Migration => EventRecord::Migration(MigrationInfo {
                src_index: b[1],
                dst_index: b[2],
                migration_cause: MigrationCause::from_wire(b[3])?,
                address: w[1],
                migrated_bytes: w[2],
                begin_time_stamp: w[3],
                end_time_stamp: w[4],
                begin_time_stamp_gpu: w[5],
                end_time_stamp_gpu: w[6],
                range_group_id: w[7],
            }),
            EventType::CpuFault => EventRecord::CpuFault(CpuFaultInfo {
                access_type: MemoryAccessType::from_wire(b[1])?,
                preferred_location: b[2],
                address: w[1],
                time_stamp: w[2],
                pid: lo32(w[3]),
                thread_id: hi32(w[3]),
                pc: w[4],
            }),
            EventType::GpuFault => EventRecord::GpuFault(GpuFaultInfo {
                gpu_index: b[1],
                fault_type: FaultType::from_wire(b[2])?,
                access_type: MemoryAccessType::from_wire(b[3])?,
                client_type: FaultClientType::from_wire(b[4])?,
                gpc_id: w[1] as u16,
                channel_id: (w[1] >> 16) as u16,
                client_id: (w[1] >> 32) as u16,
                address: w[2],
                time_stamp: w[3],
                time_stamp_gpu: w[4],
                batch_id: w[5] as u32,
            }),
            EventType::GpuFaultReplay => EventRecord::GpuFaultReplay(GpuFaultReplayInfo {
                gpu_index: b[1],
                client_type: FaultClientType::from_wire(b[2])?,
                batch_id: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
                time_stamp: w[1],
                time_stamp_gpu: w[2],
            }),
            EventType::FatalFault => EventRecord::FatalFault(FatalFaultInfo {
                processor_index: b[1],
                access_type: MemoryAccessType::from_wire(b[2])?,
                fault_type: FaultType::from_wire(b[3])?,
                reason: FatalReason::from_wire(b[4])?,
                address: w[1],
                time_stamp: w[2],
            }),
            EventType::ReadDuplicate | EventType::ThrashingDetected => {
                let info = ProcessorSetInfo {
                    processors: w[1],
                    address: w[2],
                    size: w[3],
                    time_stamp: w[4],
                };
                if ty == EventType::ReadDuplicate {
                    EventRecord::ReadDuplicate(info)
                } else {
                    EventRecord::ThrashingDetected(info)
                }
            }
            EventType::ReadDuplicateInvalidate => {
                EventRecord::ReadDuplicateInvalidate(ReadDuplicateInvalidateInfo {
                    resident_index: b[1],
                    address: w[1],
                    size: w[2],
                    time_stamp: w[3],
                })
            }
            EventType::ThrottlingStart | EventType::ThrottlingEnd => {
                let info = ThrottlingInfo {
                    processor_index: b[1],
                    address: w[1],
                    time_stamp: w[2],
                };
                if ty == EventType::ThrottlingStart {
                    EventRecord::ThrottlingStart(info)
                } else {
                    EventRecord::ThrottlingEnd(info)
                }
            }
            EventType::MapRemote => EventRecord::MapRemote(MapRemoteInfo {
                src_index: b[1],
                dst_index: b[2],
                map_remote_cause: MapRemoteCause::from_wire(b[3])?,
                address: w[1],
                size: w[2],
                time_stamp: w[3],
                time_stamp_gpu: w[4],
            }),
            EventType::TestAccessCounter => EventRecord::TestAccessCounter(AccessCounterInfo {
                src_index: b[1],
                aperture: Aperture::from_wire(b[2])?,
                instance_ptr_aperture: Aperture::from_wire(b[3])?,
                is_virtual: b[4] != 0,
                is_from_cpu: b[5] != 0,
                on_managed: b[6] != 0,
                ve_id: b[7],
                address: w[1],
                instance_ptr: w[2],
                value: lo32(w[3]),
                sub_granularity: hi32(w[3]),
                tag: lo32(w[4]),
                bank: hi32(w[4]),
            }),
            EventType::TestHmmSplitInvalidate => EventRecord::TestHmmSplitInvalidate,
            // Catalogued but never produced by this core.
            EventType::Invalid
            | EventType::MemoryAlloc
            | EventType::MemoryFree
            | EventType::MemoryViolation
            | EventType::FaultBufferOverflow
            | EventType::PageSizeChange
            | EventType::Eviction => return None,
        };
        Some(record)
    }
}
