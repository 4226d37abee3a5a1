//! # Read Planning
//!
//! Groups a device's readable parameters into the fewest transport requests.
//!
//! ## How It Works
//!
//! Parameters are grouped by read access kind, sorted by start address, and
//! merged run-length style: a parameter joins the open batch when its range
//! touches or overlaps it and the merged span still fits the per-kind
//! ceiling from [`DeviceLimits`]. Otherwise the batch is closed and a new one
//! starts at that parameter. A parameter that fits the ceiling never straddles
//! two requests.
//!
//! A parameter wider than the ceiling is cut into ceiling-sized pieces, one
//! request each; its last piece stays open for the parameters that follow.
//! Each piece is a [`BatchMember`] whose `part` locates it inside the
//! parameter, so the caller can reassemble the words before decoding. No
//! request is ever larger than the ceiling.
//!
//! Plans are deterministic: batches are ordered by access kind
//! (coils, discrete inputs, holding registers, input registers), then by
//! start address.
//!
//! ## Example
//!
//! ```rust
//! use voltage_regbus::{build_read_plan, AccessKind, DataType, DeviceLimits, Parameter};
//!
//! let params = vec![
//!     Parameter::scalar("a", AccessKind::ReadHoldingRegisters, DataType::UInt16, 0).unwrap(),
//!     Parameter::scalar("b", AccessKind::ReadHoldingRegisters, DataType::Float, 1).unwrap(),
//!     Parameter::scalar("c", AccessKind::ReadHoldingRegisters, DataType::UInt16, 10).unwrap(),
//! ];
//!
//! let plan = build_read_plan(&params, &DeviceLimits::default());
//! assert_eq!(plan.len(), 2);
//! assert_eq!((plan[0].start, plan[0].count), (0, 3));
//! assert_eq!((plan[1].start, plan[1].count), (10, 1));
//! ```

use tracing::debug;

use crate::device_limits::DeviceLimits;
use crate::parameter::{AccessKind, Parameter};

/// Where one parameter's data sits inside a batch response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchMember {
    /// Index of the parameter in the slice the plan was built from.
    pub index: usize,
    /// Offset of the parameter's first address from the batch start.
    pub offset: u16,
    /// Number of addresses this member covers.
    pub len: u16,
    /// Offset of this member inside the parameter. Non-zero only for the
    /// later pieces of a split parameter.
    pub part: u16,
}

impl BatchMember {
    /// Range of the member inside a response buffer.
    #[inline]
    pub fn span(&self) -> std::ops::Range<usize> {
        let offset = usize::from(self.offset);
        offset..offset + usize::from(self.len)
    }

    /// True when this member carries the whole parameter.
    #[inline]
    pub fn is_whole(&self, param: &Parameter) -> bool {
        self.part == 0 && self.len == param.len()
    }
}

/// One transport read covering one or more parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub access: AccessKind,
    pub start: u16,
    pub count: u16,
    pub members: Vec<BatchMember>,
}

impl BatchRequest {
    /// A request for `len` addresses of `param`, starting `part` addresses in.
    fn piece(index: usize, param: &Parameter, part: u16, len: u16) -> Self {
        Self {
            access: param.access(),
            start: param.start() + part,
            count: len,
            members: vec![BatchMember {
                index,
                offset: 0,
                len,
                part,
            }],
        }
    }

    #[inline]
    fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.count)
    }

    /// Exclusive end if `param` joined this batch, or `None` when it would
    /// leave a gap.
    fn merged_end(&self, param: &Parameter) -> Option<u32> {
        if param.start() < self.start || u32::from(param.start()) > self.end() {
            return None;
        }
        Some(self.end().max(param.end()))
    }

    fn push(&mut self, index: usize, param: &Parameter, merged_end: u32) {
        self.count = (merged_end - u32::from(self.start)) as u16;
        self.members.push(BatchMember {
            index,
            offset: param.start() - self.start,
            len: param.len(),
            part: 0,
        });
    }
}

/// Build a read plan for `params` under `limits`.
///
/// Write-only parameters are skipped. Every request's `count` is at most the
/// kind's ceiling.
pub fn build_read_plan(params: &[Parameter], limits: &DeviceLimits) -> Vec<BatchRequest> {
    let mut plan = Vec::new();

    for kind in AccessKind::READ_KINDS {
        let ceiling = limits.ceiling_for(kind).max(1);

        let mut indices: Vec<usize> = params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.access() == kind)
            .map(|(i, _)| i)
            .collect();
        // Stable sort keeps declaration order for equal starts.
        indices.sort_by_key(|&i| params[i].start());

        let mut open: Option<BatchRequest> = None;
        for index in indices {
            let param = &params[index];

            if let Some(batch) = open.as_mut() {
                match batch.merged_end(param) {
                    Some(end) if end - u32::from(batch.start) <= u32::from(ceiling) => {
                        batch.push(index, param, end);
                        continue;
                    }
                    _ => plan.extend(open.take()),
                }
            }

            if param.len() > ceiling {
                debug!(
                    "Parameter {} spans {} addresses, split into {} requests of at most {}",
                    param.name(),
                    param.len(),
                    param.len().div_ceil(ceiling),
                    ceiling
                );
            }
            let mut part = 0;
            while param.len() - part > ceiling {
                plan.push(BatchRequest::piece(index, param, part, ceiling));
                part += ceiling;
            }
            open = Some(BatchRequest::piece(index, param, part, param.len() - part));
        }
        plan.extend(open);
    }

    debug!("Built read plan with {} request(s)", plan.len());
    plan
}

// ============================================================================
// Tests
// ============================================================================
