//! Probe-call descriptors.
//!
//! The rewriter never invents call shapes on the fly: every probe entry point
//! it may emit is declared here with its linkage name and stack shape. The
//! runtime probe exports free functions under exactly these names, so the
//! spliced `Invoke` instructions resolve without the subject knowing anything
//! about the probe's internals.
//!
//! When the probe library itself is the unit being instrumented, emitted and
//! rewritten invocations use a renamed twin copy so the probe cannot recurse
//! into itself.

use crate::ir::CallSite;

/// Shape of one probe entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeDescriptor {
    pub name: &'static str,
    pub arg_count: u8,
    pub returns_value: bool,
}

impl ProbeDescriptor {
    /// Materialize a call site, twin-renamed when requested.
    pub fn call(&self, twin: bool) -> CallSite {
        let target = if twin {
            twin_name(self.name)
        } else {
            self.name.to_owned()
        };
        CallSite {
            target,
            arg_count: self.arg_count,
            returns_value: self.returns_value,
        }
    }
}

/// Linkage-name prefix shared by every probe entry point.
pub const PROBE_PREFIX: &str = "tracery_probe_";

/// Suffix of the renamed copy used under self-instrumentation.
pub const TWIN_SUFFIX: &str = "__twin";

/// One-time startup: `(target_junit)`.
pub const START: ProbeDescriptor = ProbeDescriptor {
    name: "tracery_probe_start",
    arg_count: 1,
    returns_value: false,
};

/// Compatible mode per-event: `(packed_id, signature)`.
pub const TRACE_EVENT: ProbeDescriptor = ProbeDescriptor {
    name: "tracery_probe_trace_event",
    arg_count: 2,
    returns_value: false,
};

/// Compatible mode first-entry: `(signature, object_count)`.
pub const OBJECT_COUNT: ProbeDescriptor = ProbeDescriptor {
    name: "tracery_probe_object_count",
    arg_count: 2,
    returns_value: false,
};

/// Coverage mode method entry: `(signature, object_count)` returning the
/// per-thread coverage array.
pub const OBJECT_ARRAY: ProbeDescriptor = ProbeDescriptor {
    name: "tracery_probe_object_array",
    arg_count: 2,
    returns_value: true,
};

/// Sequence mode method entry: `(signature, object_count)`.
pub const SEQUENCE_ENTER: ProbeDescriptor = ProbeDescriptor {
    name: "tracery_probe_sequence_enter",
    arg_count: 2,
    returns_value: false,
};

/// Sequence mode per-event: `(packed_id)`.
pub const SEQUENCE_APPEND: ProbeDescriptor = ProbeDescriptor {
    name: "tracery_probe_sequence_append",
    arg_count: 1,
    returns_value: false,
};

/// Sequence mode exceptional-exit marker: `()`.
pub const SEQUENCE_EXIT: ProbeDescriptor = ProbeDescriptor {
    name: "tracery_probe_sequence_exit",
    arg_count: 0,
    returns_value: false,
};

/// Hashing mode per-event: `(global_index)`.
pub const HASH_EVENT: ProbeDescriptor = ProbeDescriptor {
    name: "tracery_probe_hash_event",
    arg_count: 1,
    returns_value: false,
};

/// The twin linkage name for a probe entry point.
pub fn twin_name(name: &str) -> String {
    format!("{name}{TWIN_SUFFIX}")
}

/// True if `target` names a probe entry point (twin or not).
pub fn is_probe_call(target: &str) -> bool {
    target.starts_with(PROBE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twin_rename_keeps_prefix() {
        let call = TRACE_EVENT.call(true);
        assert_eq!(call.target, "tracery_probe_trace_event__twin");
        assert!(is_probe_call(&call.target));
        assert_eq!(call.arg_count, 2);
    }

    #[test]
    fn descriptors_are_probe_calls() {
        for d in [
            START,
            TRACE_EVENT,
            OBJECT_COUNT,
            OBJECT_ARRAY,
            SEQUENCE_ENTER,
            SEQUENCE_APPEND,
            SEQUENCE_EXIT,
            HASH_EVENT,
        ] {
            assert!(is_probe_call(d.name));
        }
    }
}
