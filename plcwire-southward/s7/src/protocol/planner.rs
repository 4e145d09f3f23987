//! Packs read/write items into batches that fit the negotiated PDU length.
//!
//! Items keep their request order: each batch is a contiguous range of the
//! input, so per-item results can be stitched back together by position.
use super::frame::S7Tag;
use bytes::Bytes;
use plcwire_sdk::{DriverError, DriverResult};
use std::ops::Range;

const S7_REQ_HEADER_JOB: usize = 10;
const S7_RESP_HEADER_ACK_DATA: usize = 12;
// function + item count
const S7_PARAM_BASE: usize = 2;
const S7_VAR_SPEC_LEN: usize = 12;
// return code + transport size + u16 length
const S7_DATA_ITEM_HEADER: usize = 4;
/// Item limit most CPUs enforce per ReadVar/WriteVar regardless of PDU size.
pub const DEFAULT_MAX_ITEMS: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct PlannerConfig {
    /// Negotiated S7 PDU length (header + parameter + data)
    pub pdu_len: usize,
    pub max_items: usize,
}

impl PlannerConfig {
    pub fn new(pdu_len: u16) -> Self {
        Self {
            pdu_len: pdu_len as usize,
            max_items: DEFAULT_MAX_ITEMS,
        }
    }
}

#[inline]
fn padded(len: usize, last: bool) -> usize {
    if last || len % 2 == 0 {
        len
    } else {
        len + 1
    }
}

/// Greedy batching. `req` and `resp` return an item's cost on either side;
/// padding is charged for every item but the last of a batch, so the
/// running totals are conservative by at most one byte.
fn plan<T>(
    config: &PlannerConfig,
    items: &[T],
    req_base: usize,
    resp_base: usize,
    req: impl Fn(&T) -> usize,
    resp: impl Fn(&T) -> usize,
) -> Vec<Range<usize>> {
    let mut batches = Vec::new();
    let mut start = 0;
    let (mut req_len, mut resp_len) = (req_base, resp_base);
    for (idx, item) in items.iter().enumerate() {
        let (r, s) = (req(item), resp(item));
        let full = idx - start >= config.max_items.max(1)
            || req_len + r > config.pdu_len
            || resp_len + s > config.pdu_len;
        if full && idx > start {
            batches.push(start..idx);
            start = idx;
            req_len = req_base;
            resp_len = resp_base;
        }
        req_len += r;
        resp_len += s;
    }
    if start < items.len() {
        batches.push(start..items.len());
    }
    batches
}

/// Batches for a ReadVar of `tags`.
pub fn plan_read(config: &PlannerConfig, tags: &[S7Tag]) -> DriverResult<Vec<Range<usize>>> {
    let req_base = S7_REQ_HEADER_JOB + S7_PARAM_BASE;
    let resp_base = S7_RESP_HEADER_ACK_DATA + S7_PARAM_BASE;
    for tag in tags {
        if resp_base + S7_DATA_ITEM_HEADER + tag.byte_len() > config.pdu_len {
            return Err(DriverError::UnsupportedOperation(format!(
                "{tag} ({} bytes) does not fit a {} byte PDU",
                tag.byte_len(),
                config.pdu_len
            )));
        }
    }
    Ok(plan(
        config,
        tags,
        req_base,
        resp_base,
        |_| S7_VAR_SPEC_LEN,
        |t| S7_DATA_ITEM_HEADER + padded(t.byte_len(), false),
    ))
}

/// Batches for a WriteVar of already encoded items.
pub fn plan_write(
    config: &PlannerConfig,
    items: &[(&S7Tag, Bytes)],
) -> DriverResult<Vec<Range<usize>>> {
    let req_base = S7_REQ_HEADER_JOB + S7_PARAM_BASE;
    let resp_base = S7_RESP_HEADER_ACK_DATA + S7_PARAM_BASE;
    for (tag, data) in items {
        if req_base + S7_VAR_SPEC_LEN + S7_DATA_ITEM_HEADER + data.len() > config.pdu_len {
            return Err(DriverError::UnsupportedOperation(format!(
                "{tag} ({} bytes) does not fit a {} byte PDU",
                data.len(),
                config.pdu_len
            )));
        }
    }
    Ok(plan(
        config,
        items,
        req_base,
        resp_base,
        |(_, d)| S7_VAR_SPEC_LEN + S7_DATA_ITEM_HEADER + padded(d.len(), false),
        |_| 1,
    ))
}

#[cfg(test)]
mod tests {
    use super::super::frame::parse_tag;
    use super::*;

    fn tags(specs: &[&str]) -> Vec<S7Tag> {
        specs.iter().map(|s| parse_tag(s).unwrap()).collect()
    }

    #[test]
    fn small_reads_share_one_batch() {
        let t = tags(&["%DB1.DBW0:INT", "%DB1.DBD2:REAL", "%MX0.1:BOOL"]);
        let plan = plan_read(&PlannerConfig::new(240), &t).unwrap();
        assert_eq!(plan, vec![0..3]);
    }

    #[test]
    fn item_limit_splits_batches() {
        let t: Vec<S7Tag> = (0..45)
            .map(|i| parse_tag(&format!("%DB1.DBB{i}:BYTE")).unwrap())
            .collect();
        let plan = plan_read(&PlannerConfig::new(960), &t).unwrap();
        assert_eq!(plan, vec![0..20, 20..40, 40..45]);
    }

    #[test]
    fn response_size_splits_large_reads() {
        // 100 + 4 bytes per item in the response; two fit in 240, three do not.
        let t = tags(&["%DB1.DBB0:BYTE[100]", "%DB1.DBB100:BYTE[100]", "%DB1.DBB200:BYTE[100]"]);
        let plan = plan_read(&PlannerConfig::new(240), &t).unwrap();
        assert_eq!(plan, vec![0..2, 2..3]);
    }

    #[test]
    fn oversized_item_is_rejected() {
        let t = tags(&["%DB1.DBB0:BYTE[400]"]);
        let err = plan_read(&PlannerConfig::new(240), &t).unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedOperation(_)));
    }

    #[test]
    fn writes_account_for_payload() {
        let t = tags(&["%DB1.DBB0:BYTE[100]", "%DB1.DBB100:BYTE[100]"]);
        let items: Vec<(&S7Tag, Bytes)> = t
            .iter()
            .map(|tag| (tag, Bytes::from(vec![0u8; 100])))
            .collect();
        let plan = plan_write(&PlannerConfig::new(240), &items).unwrap();
        assert_eq!(plan, vec![0..1, 1..2]);
    }
}
