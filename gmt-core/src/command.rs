//! Wire format: command records and the `block_info` segment header
//! (spec.md §4.3, §6 "Wire format").
//!
//! Records are packed by hand rather than through `serde`/`bincode`: the
//! spec pins exact bit widths (`type=5, tid=20, nest-level=5, iter=48,
//! virt-addr=48, args-size=20`) that must match byte-for-byte across nodes
//! running different builds, which is a guarantee a general-purpose
//! serializer's framing does not give us.

use crate::handle::GlobalHandle;
use crate::mtask::TaskId;
use crate::spawn_handle::SpawnHandleId;

/// One network buffer segment's header (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub cmds_bytes: u32,
    pub data_bytes: u32,
}

pub const BLOCK_INFO_LEN: usize = 8;

impl BlockInfo {
    pub fn write(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.cmds_bytes.to_le_bytes());
        out.extend_from_slice(&self.data_bytes.to_le_bytes());
    }

    pub fn read(buf: &[u8]) -> Option<(BlockInfo, &[u8])> {
        if buf.len() < BLOCK_INFO_LEN {
            return None;
        }
        let cmds_bytes = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let data_bytes = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        Some((BlockInfo { cmds_bytes, data_bytes }, &buf[BLOCK_INFO_LEN..]))
    }
}

/// The 5-bit type tag. Dispatch in `helper.rs` is a tagged switch over this,
/// per spec.md §9 "no polymorphic dispatch is needed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    Allocate = 0,
    Free = 1,
    Put = 2,
    PutValue = 3,
    Get = 4,
    AtomicAdd = 5,
    AtomicCas = 6,
    ExecutePreemptable = 7,
    ExecuteNonPreemptable = 8,
    ForLoop = 9,
    ForCompletion = 10,
    ExecuteCompletion = 11,
    HandleCheckTerminated = 12,
    HandleCheckCreated = 13,
    HandleCheckReset = 14,
    ReservationRequest = 15,
    ReservationReply = 16,
    ReplyAck = 17,
    ReplyValue = 18,
    ReplyGetBytes = 19,
}

impl CommandType {
    fn from_u8(v: u8) -> Option<CommandType> {
        use CommandType::*;
        Some(match v {
            0 => Allocate,
            1 => Free,
            2 => Put,
            3 => PutValue,
            4 => Get,
            5 => AtomicAdd,
            6 => AtomicCas,
            7 => ExecutePreemptable,
            8 => ExecuteNonPreemptable,
            9 => ForLoop,
            10 => ForCompletion,
            11 => ExecuteCompletion,
            12 => HandleCheckTerminated,
            13 => HandleCheckCreated,
            14 => HandleCheckReset,
            15 => ReservationRequest,
            16 => ReservationReply,
            17 => ReplyAck,
            18 => ReplyValue,
            19 => ReplyGetBytes,
            _ => return None,
        })
    }
}

/// Common fields every record opens with: type tag, originating task id
/// (node-local, 20 bits worth of id space but stored widened), and nesting
/// level of the issuing uthread. `iter`/`virt-addr`/`args-size` are carried
/// only by the command kinds that need them, each within its own
/// fixed-layout tail.
#[derive(Debug, Clone, Copy)]
pub struct CommandHeader {
    pub kind: CommandType,
    pub origin_task: TaskId,
    pub nesting_level: u8,
}

const HEADER_LEN: usize = 1 + 8 + 1;

fn write_header(h: CommandHeader, out: &mut Vec<u8>) {
    out.push(h.kind as u8);
    out.extend_from_slice(&h.origin_task.to_le_bytes());
    out.push(h.nesting_level);
}

fn read_header(buf: &[u8]) -> Option<(CommandHeader, &[u8])> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let kind = CommandType::from_u8(buf[0])?;
    let origin_task = TaskId::from_le_bytes(buf[1..9].try_into().unwrap());
    let nesting_level = buf[9];
    Some((
        CommandHeader {
            kind,
            origin_task,
            nesting_level,
        },
        &buf[HEADER_LEN..],
    ))
}

/// A fully decoded command record. `args_size`/data fragment bytes are
/// never inlined here — a record only ever carries a length and the data
/// lives in the segment's data region, referenced in declaration order
/// (spec.md §6), so the caller threads `data: &[u8]` alongside each record.
#[derive(Debug, Clone)]
pub enum Command {
    Allocate {
        header: CommandHeader,
        num_elems: u64,
        elem_bytes: u32,
        policy: u8,
        zero_init: bool,
        reply_task: TaskId,
    },
    Free {
        header: CommandHeader,
        handle: GlobalHandle,
    },
    Put {
        header: CommandHeader,
        handle: GlobalHandle,
        local_offset: u64,
        args_size: u32,
    },
    PutValue {
        header: CommandHeader,
        handle: GlobalHandle,
        local_offset: u64,
        value: u64,
        value_bytes: u8,
    },
    Get {
        header: CommandHeader,
        handle: GlobalHandle,
        local_offset: u64,
        len: u32,
        reply_task: TaskId,
    },
    AtomicAdd {
        header: CommandHeader,
        handle: GlobalHandle,
        local_offset: u64,
        delta: i64,
        reply_task: TaskId,
    },
    AtomicCas {
        header: CommandHeader,
        handle: GlobalHandle,
        local_offset: u64,
        expected: i64,
        new: i64,
        reply_task: TaskId,
    },
    ExecutePreemptable {
        header: CommandHeader,
        fn_ptr: u64,
        args_size: u32,
        reply_task: TaskId,
        virt_addr: u64,
    },
    ExecuteNonPreemptable {
        header: CommandHeader,
        fn_ptr: u64,
        args_size: u32,
        reply_task: TaskId,
        virt_addr: u64,
    },
    ForLoop {
        header: CommandHeader,
        fn_ptr: u64,
        args_size: u32,
        iter_start: u64,
        iter_end: u64,
        step: u64,
        handle: Option<SpawnHandleId>,
    },
    ForCompletion {
        header: CommandHeader,
        parent_task: TaskId,
        count: u64,
    },
    ExecuteCompletion {
        header: CommandHeader,
        parent_task: TaskId,
        ret_size: u32,
    },
    HandleCheckTerminated {
        header: CommandHeader,
        handle: SpawnHandleId,
        running_sum: u64,
    },
    HandleCheckCreated {
        header: CommandHeader,
        handle: SpawnHandleId,
        running_sum: u64,
    },
    HandleCheckReset {
        header: CommandHeader,
        handle: SpawnHandleId,
    },
    ReservationRequest {
        header: CommandHeader,
        requested: u32,
    },
    ReservationReply {
        header: CommandHeader,
        granted: u32,
    },
    ReplyAck {
        header: CommandHeader,
    },
    ReplyValue {
        header: CommandHeader,
        value: u64,
    },
    ReplyGetBytes {
        header: CommandHeader,
        len: u32,
    },
}

impl Command {
    pub fn header(&self) -> CommandHeader {
        match self {
            Command::Allocate { header, .. }
            | Command::Free { header, .. }
            | Command::Put { header, .. }
            | Command::PutValue { header, .. }
            | Command::Get { header, .. }
            | Command::AtomicAdd { header, .. }
            | Command::AtomicCas { header, .. }
            | Command::ExecutePreemptable { header, .. }
            | Command::ExecuteNonPreemptable { header, .. }
            | Command::ForLoop { header, .. }
            | Command::ForCompletion { header, .. }
            | Command::ExecuteCompletion { header, .. }
            | Command::HandleCheckTerminated { header, .. }
            | Command::HandleCheckCreated { header, .. }
            | Command::HandleCheckReset { header, .. }
            | Command::ReservationRequest { header, .. }
            | Command::ReservationReply { header, .. }
            | Command::ReplyAck { header }
            | Command::ReplyValue { header, .. }
            | Command::ReplyGetBytes { header, .. } => *header,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        write_header(self.header(), &mut out);
        match self {
            Command::Allocate {
                num_elems,
                elem_bytes,
                policy,
                zero_init,
                reply_task,
                ..
            } => {
                out.extend_from_slice(&num_elems.to_le_bytes());
                out.extend_from_slice(&elem_bytes.to_le_bytes());
                out.push(*policy);
                out.push(*zero_init as u8);
                out.extend_from_slice(&reply_task.to_le_bytes());
            }
            Command::Free { handle, .. } => out.extend_from_slice(&handle.0.to_le_bytes()),
            Command::Put {
                handle, local_offset, args_size, ..
            } => {
                out.extend_from_slice(&handle.0.to_le_bytes());
                out.extend_from_slice(&local_offset.to_le_bytes());
                out.extend_from_slice(&args_size.to_le_bytes());
            }
            Command::PutValue {
                handle,
                local_offset,
                value,
                value_bytes,
                ..
            } => {
                out.extend_from_slice(&handle.0.to_le_bytes());
                out.extend_from_slice(&local_offset.to_le_bytes());
                out.extend_from_slice(&value.to_le_bytes());
                out.push(*value_bytes);
            }
            Command::Get {
                handle,
                local_offset,
                len,
                reply_task,
                ..
            } => {
                out.extend_from_slice(&handle.0.to_le_bytes());
                out.extend_from_slice(&local_offset.to_le_bytes());
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(&reply_task.to_le_bytes());
            }
            Command::AtomicAdd {
                handle,
                local_offset,
                delta,
                reply_task,
                ..
            } => {
                out.extend_from_slice(&handle.0.to_le_bytes());
                out.extend_from_slice(&local_offset.to_le_bytes());
                out.extend_from_slice(&delta.to_le_bytes());
                out.extend_from_slice(&reply_task.to_le_bytes());
            }
            Command::AtomicCas {
                handle,
                local_offset,
                expected,
                new,
                reply_task,
                ..
            } => {
                out.extend_from_slice(&handle.0.to_le_bytes());
                out.extend_from_slice(&local_offset.to_le_bytes());
                out.extend_from_slice(&expected.to_le_bytes());
                out.extend_from_slice(&new.to_le_bytes());
                out.extend_from_slice(&reply_task.to_le_bytes());
            }
            Command::ExecutePreemptable {
                fn_ptr,
                args_size,
                reply_task,
                virt_addr,
                ..
            }
            | Command::ExecuteNonPreemptable {
                fn_ptr,
                args_size,
                reply_task,
                virt_addr,
                ..
            } => {
                out.extend_from_slice(&fn_ptr.to_le_bytes());
                out.extend_from_slice(&args_size.to_le_bytes());
                out.extend_from_slice(&reply_task.to_le_bytes());
                out.extend_from_slice(&virt_addr.to_le_bytes());
            }
            Command::ForLoop {
                fn_ptr,
                args_size,
                iter_start,
                iter_end,
                step,
                handle,
                ..
            } => {
                out.extend_from_slice(&fn_ptr.to_le_bytes());
                out.extend_from_slice(&args_size.to_le_bytes());
                out.extend_from_slice(&iter_start.to_le_bytes());
                out.extend_from_slice(&iter_end.to_le_bytes());
                out.extend_from_slice(&step.to_le_bytes());
                out.extend_from_slice(&handle.map(|h| h.0).unwrap_or(u64::MAX).to_le_bytes());
            }
            Command::ForCompletion { parent_task, count, .. } => {
                out.extend_from_slice(&parent_task.to_le_bytes());
                out.extend_from_slice(&count.to_le_bytes());
            }
            Command::ExecuteCompletion { parent_task, ret_size, .. } => {
                out.extend_from_slice(&parent_task.to_le_bytes());
                out.extend_from_slice(&ret_size.to_le_bytes());
            }
            Command::HandleCheckTerminated { handle, running_sum, .. }
            | Command::HandleCheckCreated { handle, running_sum, .. } => {
                out.extend_from_slice(&handle.0.to_le_bytes());
                out.extend_from_slice(&running_sum.to_le_bytes());
            }
            Command::HandleCheckReset { handle, .. } => out.extend_from_slice(&handle.0.to_le_bytes()),
            Command::ReservationRequest { requested, .. } => out.extend_from_slice(&requested.to_le_bytes()),
            Command::ReservationReply { granted, .. } => out.extend_from_slice(&granted.to_le_bytes()),
            Command::ReplyAck { .. } => {}
            Command::ReplyValue { value, .. } => out.extend_from_slice(&value.to_le_bytes()),
            Command::ReplyGetBytes { len, .. } => out.extend_from_slice(&len.to_le_bytes()),
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Option<(Command, &[u8])> {
        let (header, mut rest) = read_header(buf)?;
        macro_rules! take {
            ($n:expr) => {{
                if rest.len() < $n {
                    return None;
                }
                let (a, b) = rest.split_at($n);
                rest = b;
                a
            }};
        }
        let cmd = match header.kind {
            CommandType::Allocate => {
                let num_elems = u64::from_le_bytes(take!(8).try_into().unwrap());
                let elem_bytes = u32::from_le_bytes(take!(4).try_into().unwrap());
                let policy = take!(1)[0];
                let zero_init = take!(1)[0] != 0;
                let reply_task = TaskId::from_le_bytes(take!(8).try_into().unwrap());
                Command::Allocate {
                    header,
                    num_elems,
                    elem_bytes,
                    policy,
                    zero_init,
                    reply_task,
                }
            }
            CommandType::Free => Command::Free {
                header,
                handle: GlobalHandle(u64::from_le_bytes(take!(8).try_into().unwrap())),
            },
            CommandType::Put => Command::Put {
                header,
                handle: GlobalHandle(u64::from_le_bytes(take!(8).try_into().unwrap())),
                local_offset: u64::from_le_bytes(take!(8).try_into().unwrap()),
                args_size: u32::from_le_bytes(take!(4).try_into().unwrap()),
            },
            CommandType::PutValue => Command::PutValue {
                header,
                handle: GlobalHandle(u64::from_le_bytes(take!(8).try_into().unwrap())),
                local_offset: u64::from_le_bytes(take!(8).try_into().unwrap()),
                value: u64::from_le_bytes(take!(8).try_into().unwrap()),
                value_bytes: take!(1)[0],
            },
            CommandType::Get => Command::Get {
                header,
                handle: GlobalHandle(u64::from_le_bytes(take!(8).try_into().unwrap())),
                local_offset: u64::from_le_bytes(take!(8).try_into().unwrap()),
                len: u32::from_le_bytes(take!(4).try_into().unwrap()),
                reply_task: TaskId::from_le_bytes(take!(8).try_into().unwrap()),
            },
            CommandType::AtomicAdd => Command::AtomicAdd {
                header,
                handle: GlobalHandle(u64::from_le_bytes(take!(8).try_into().unwrap())),
                local_offset: u64::from_le_bytes(take!(8).try_into().unwrap()),
                delta: i64::from_le_bytes(take!(8).try_into().unwrap()),
                reply_task: TaskId::from_le_bytes(take!(8).try_into().unwrap()),
            },
            CommandType::AtomicCas => Command::AtomicCas {
                header,
                handle: GlobalHandle(u64::from_le_bytes(take!(8).try_into().unwrap())),
                local_offset: u64::from_le_bytes(take!(8).try_into().unwrap()),
                expected: i64::from_le_bytes(take!(8).try_into().unwrap()),
                new: i64::from_le_bytes(take!(8).try_into().unwrap()),
                reply_task: TaskId::from_le_bytes(take!(8).try_into().unwrap()),
            },
            CommandType::ExecutePreemptable | CommandType::ExecuteNonPreemptable => {
                let fn_ptr = u64::from_le_bytes(take!(8).try_into().unwrap());
                let args_size = u32::from_le_bytes(take!(4).try_into().unwrap());
                let reply_task = TaskId::from_le_bytes(take!(8).try_into().unwrap());
                let virt_addr = u64::from_le_bytes(take!(8).try_into().unwrap());
                if matches!(header.kind, CommandType::ExecutePreemptable) {
                    Command::ExecutePreemptable {
                        header,
                        fn_ptr,
                        args_size,
                        reply_task,
                        virt_addr,
                    }
                } else {
                    Command::ExecuteNonPreemptable {
                        header,
                        fn_ptr,
                        args_size,
                        reply_task,
                        virt_addr,
                    }
                }
            }
            CommandType::ForLoop => {
                let fn_ptr = u64::from_le_bytes(take!(8).try_into().unwrap());
                let args_size = u32::from_le_bytes(take!(4).try_into().unwrap());
                let iter_start = u64::from_le_bytes(take!(8).try_into().unwrap());
                let iter_end = u64::from_le_bytes(take!(8).try_into().unwrap());
                let step = u64::from_le_bytes(take!(8).try_into().unwrap());
                let handle_bits = u64::from_le_bytes(take!(8).try_into().unwrap());
                Command::ForLoop {
                    header,
                    fn_ptr,
                    args_size,
                    iter_start,
                    iter_end,
                    step,
                    handle: if handle_bits == u64::MAX { None } else { Some(SpawnHandleId(handle_bits)) },
                }
            }
            CommandType::ForCompletion => Command::ForCompletion {
                header,
                parent_task: TaskId::from_le_bytes(take!(8).try_into().unwrap()),
                count: u64::from_le_bytes(take!(8).try_into().unwrap()),
            },
            CommandType::ExecuteCompletion => Command::ExecuteCompletion {
                header,
                parent_task: TaskId::from_le_bytes(take!(8).try_into().unwrap()),
                ret_size: u32::from_le_bytes(take!(4).try_into().unwrap()),
            },
            CommandType::HandleCheckTerminated | CommandType::HandleCheckCreated => {
                let handle = SpawnHandleId(u64::from_le_bytes(take!(8).try_into().unwrap()));
                let running_sum = u64::from_le_bytes(take!(8).try_into().unwrap());
                if matches!(header.kind, CommandType::HandleCheckTerminated) {
                    Command::HandleCheckTerminated { header, handle, running_sum }
                } else {
                    Command::HandleCheckCreated { header, handle, running_sum }
                }
            }
            CommandType::HandleCheckReset => Command::HandleCheckReset {
                header,
                handle: SpawnHandleId(u64::from_le_bytes(take!(8).try_into().unwrap())),
            },
            CommandType::ReservationRequest => Command::ReservationRequest {
                header,
                requested: u32::from_le_bytes(take!(4).try_into().unwrap()),
            },
            CommandType::ReservationReply => Command::ReservationReply {
                header,
                granted: u32::from_le_bytes(take!(4).try_into().unwrap()),
            },
            CommandType::ReplyAck => Command::ReplyAck { header },
            CommandType::ReplyValue => Command::ReplyValue {
                header,
                value: u64::from_le_bytes(take!(8).try_into().unwrap()),
            },
            CommandType::ReplyGetBytes => Command::ReplyGetBytes {
                header,
                len: u32::from_le_bytes(take!(4).try_into().unwrap()),
            },
        };
        Some((cmd, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr() -> CommandHeader {
        CommandHeader {
            kind: CommandType::Put,
            origin_task: 42,
            nesting_level: 2,
        }
    }

    #[test]
    fn block_info_roundtrips() {
        let bi = BlockInfo {
            cmds_bytes: 128,
            data_bytes: 256,
        };
        let mut buf = Vec::new();
        bi.write(&mut buf);
        let (back, rest) = BlockInfo::read(&buf).unwrap();
        assert_eq!(back, bi);
        assert!(rest.is_empty());
    }

    #[test]
    fn put_value_roundtrips() {
        let cmd = Command::PutValue {
            header: CommandHeader {
                kind: CommandType::PutValue,
                ..hdr()
            },
            handle: GlobalHandle(0xdead_beef),
            local_offset: 800,
            value: 12345,
            value_bytes: 8,
        };
        let bytes = cmd.encode();
        let (back, rest) = Command::decode(&bytes).unwrap();
        assert!(rest.is_empty());
        match back {
            Command::PutValue {
                handle, local_offset, value, value_bytes, ..
            } => {
                assert_eq!(handle.0, 0xdead_beef);
                assert_eq!(local_offset, 800);
                assert_eq!(value, 12345);
                assert_eq!(value_bytes, 8);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn for_loop_roundtrips_with_no_handle() {
        let cmd = Command::ForLoop {
            header: CommandHeader {
                kind: CommandType::ForLoop,
                ..hdr()
            },
            fn_ptr: 0x1000,
            args_size: 16,
            iter_start: 0,
            iter_end: 1024,
            step: 4,
            handle: None,
        };
        let bytes = cmd.encode();
        let (back, _) = Command::decode(&bytes).unwrap();
        match back {
            Command::ForLoop { handle, iter_end, .. } => {
                assert!(handle.is_none());
                assert_eq!(iter_end, 1024);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn two_records_back_to_back_decode_independently() {
        let a = Command::ReplyAck { header: hdr() }.encode();
        let b = Command::ReplyValue { header: hdr(), value: 7 }.encode();
        let mut buf = a.clone();
        buf.extend_from_slice(&b);
        let (first, rest) = Command::decode(&buf).unwrap();
        assert!(matches!(first, Command::ReplyAck { .. }));
        let (second, rest) = Command::decode(rest).unwrap();
        assert!(rest.is_empty());
        match second {
            Command::ReplyValue { value, .. } => assert_eq!(value, 7),
            _ => panic!("wrong variant"),
        }
    }
}
