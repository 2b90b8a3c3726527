//! Message builders for the send pipeline: first-round pushes, block
//! fragments, and pull requests.

use crate::types::{KvPairs, Message, MsgType, RequestMeta};

fn message_with(kvs: &KvPairs, mut meta: RequestMeta) -> Message {
    meta.first_key = kvs.keys.first().copied().unwrap_or(0);
    let mut msg = Message {
        meta,
        ..Message::default()
    };
    msg.attach(kvs.keys.clone(), kvs.vals.clone(), kvs.lens.clone());
    msg
}

/// Build the single whole-slice message for the first push of a training
/// round. Contribution scoring is bypassed for these.
pub fn first_push_message(kvs: &KvPairs, base: &RequestMeta) -> Message {
    let mut meta = base.clone();
    meta.msg_type = MsgType::FirstPush;
    meta.seq = 0;
    meta.seq_begin = 0;
    meta.seq_end = 0;
    meta.val_bytes = 0;
    meta.total_bytes = kvs.vals.len();
    message_with(kvs, meta)
}

/// Build a pull request; the value payload stays empty.
pub fn pull_message(kvs: &KvPairs, base: &RequestMeta) -> Message {
    let mut meta = base.clone();
    meta.msg_type = MsgType::Pull;
    meta.seq = 0;
    meta.seq_begin = 0;
    meta.seq_end = 0;
    meta.val_bytes = 0;
    meta.total_bytes = kvs.vals.len();
    message_with(kvs, meta)
}

/// Split one per-server slice into block fragments.
///
/// Every fragment carries the full key and length arrays of the slice plus
/// one block of the value payload, addressed by `val_bytes`. Fragments are
/// emitted in `seq` order, so the terminator (`seq == seq_end`) is last by
/// construction; the ranker relies on that placement.
///
/// With blocking disabled (or a zero block size) the whole payload travels
/// as a single fragment. An empty payload still yields its terminator so the
/// receiver can close out the sequence.
pub fn plan_push_fragments(
    kvs: &KvPairs,
    enable_block: bool,
    block_size: usize,
    base: &RequestMeta,
) -> Vec<Message> {
    let total = kvs.vals.len();
    let block = if enable_block && block_size > 0 {
        block_size
    } else {
        total.max(1)
    };
    let seq_num = total.div_ceil(block).max(1);

    let mut out = Vec::with_capacity(seq_num);
    let mut offset = 0usize;
    for seq in 0..seq_num {
        let len = block.min(total - offset);
        let mut meta = base.clone();
        meta.msg_type = MsgType::PushFragment;
        meta.first_key = kvs.keys.first().copied().unwrap_or(0);
        meta.seq = seq as u32;
        meta.seq_begin = 0;
        meta.seq_end = (seq_num - 1) as u32;
        meta.val_bytes = offset;
        meta.total_bytes = total;
        let mut msg = Message {
            meta,
            ..Message::default()
        };
        msg.attach(
            kvs.keys.clone(),
            kvs.vals.slice(offset..offset + len),
            kvs.lens.clone(),
        );
        out.push(msg);
        offset += len;
    }
    out
}
