use std::fmt;

use bitflags::bitflags;
use serde::Serialize;

bitflags! {
    /// Modifiers Slurm attaches to a base node state, either as `+FLAG` compounds
    /// (`idle+drain`) or as single-character suffixes (`down*`, `idle~`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    #[serde(transparent)]
    pub struct NodeStateFlags: u32 {
        const DRAIN = 1 << 0;
        const NOT_RESPONDING = 1 << 1;
        const POWERED_DOWN = 1 << 2;
        const POWERING_UP = 1 << 3;
        const POWERING_DOWN = 1 << 4;
        const MAINT = 1 << 5;
        const RESERVED = 1 << 6;
        const COMPLETING = 1 << 7;
        const FAIL = 1 << 8;
        const REBOOT = 1 << 9;
        const PLANNED = 1 << 10;
        const CLOUD = 1 << 11;
    }
}

// any of these makes a node unusable for new work, whatever its base state
const INACCESSIBLE: NodeStateFlags = NodeStateFlags::DRAIN
    .union(NodeStateFlags::NOT_RESPONDING)
    .union(NodeStateFlags::POWERED_DOWN)
    .union(NodeStateFlags::MAINT)
    .union(NodeStateFlags::FAIL);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Idle,
    Allocated,
    Mixed,
    Down,
    Drain,
    Unknown(String),
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Idle => write!(f, "IDLE"),
            NodeState::Allocated => write!(f, "ALLOCATED"),
            NodeState::Mixed => write!(f, "MIXED"),
            NodeState::Down => write!(f, "DOWN"),
            NodeState::Drain => write!(f, "DRAIN"),
            NodeState::Unknown(s) => write!(f, "UNKNOWN({})", s),
        }
    }
}

/// Parses one word of a Slurm state, long (`allocated`) or short (`alloc`) form,
/// into its base state and any flags the word implies
fn parse_state_word(word: &str) -> (Option<NodeState>, NodeStateFlags) {
    let none = NodeStateFlags::empty();
    match word {
        "idle" => (Some(NodeState::Idle), none),
        "allocated" | "alloc" => (Some(NodeState::Allocated), none),
        "mixed" | "mix" => (Some(NodeState::Mixed), none),
        "down" => (Some(NodeState::Down), none),
        "drained" | "drain" => (Some(NodeState::Drain), NodeStateFlags::DRAIN),
        "draining" | "drng" => (
            Some(NodeState::Drain),
            NodeStateFlags::DRAIN | NodeStateFlags::COMPLETING,
        ),
        "completing" | "comp" => (Some(NodeState::Allocated), NodeStateFlags::COMPLETING),
        "fail" | "failing" | "failg" => (Some(NodeState::Down), NodeStateFlags::FAIL),
        "maint" => (Some(NodeState::Idle), NodeStateFlags::MAINT),
        "reserved" | "resv" => (Some(NodeState::Idle), NodeStateFlags::RESERVED),
        "planned" | "plnd" => (Some(NodeState::Idle), NodeStateFlags::PLANNED),
        "powered_down" | "power_down" | "powered_off" => {
            (Some(NodeState::Idle), NodeStateFlags::POWERED_DOWN)
        }
        "powering_up" | "pow_up" => (Some(NodeState::Idle), NodeStateFlags::POWERING_UP),
        "powering_down" | "pow_dn" => (Some(NodeState::Idle), NodeStateFlags::POWERING_DOWN),
        "reboot_issued" | "reboot_requested" | "reboot" | "boot" => {
            (None, NodeStateFlags::REBOOT)
        }
        "not_responding" | "no_respond" => (None, NodeStateFlags::NOT_RESPONDING),
        "cloud" => (None, NodeStateFlags::CLOUD),
        _ => (None, none),
    }
}

fn suffix_flag(c: char) -> Option<NodeStateFlags> {
    match c {
        '*' => Some(NodeStateFlags::NOT_RESPONDING),
        '~' => Some(NodeStateFlags::POWERED_DOWN),
        '#' => Some(NodeStateFlags::POWERING_UP),
        '%' | '!' => Some(NodeStateFlags::POWERING_DOWN),
        '$' => Some(NodeStateFlags::MAINT),
        '@' | '^' => Some(NodeStateFlags::REBOOT),
        '-' => Some(NodeStateFlags::PLANNED),
        _ => None,
    }
}

impl NodeState {
    /// Parses a state as printed by `sinfo` (`%T`, `%t` or `StateLong`), such as
    /// `idle`, `mix`, `down*`, `idle+drain` or `allocated+completing~`.
    ///
    /// An idle node with the DRAIN flag is reported as [`NodeState::Drain`], matching
    /// how `sinfo` itself prints `drained`. Unrecognized base words are kept as
    /// [`NodeState::Unknown`] rather than rejected. Returns `None` only for an empty field
    pub fn parse(raw: &str) -> Option<(NodeState, NodeStateFlags)> {
        let lowered = raw.trim().to_ascii_lowercase();
        if lowered.is_empty() {
            return None;
        }

        let mut flags = NodeStateFlags::empty();
        let mut words = lowered.split('+');
        let head = words.next().unwrap_or_default();

        let base_word = head.trim_end_matches(|c| {
            if let Some(flag) = suffix_flag(c) {
                flags |= flag;
                true
            } else {
                false
            }
        });

        let (base, implied) = parse_state_word(base_word);
        flags |= implied;
        let mut base = base.unwrap_or_else(|| NodeState::Unknown(base_word.to_string()));

        for word in words {
            let word = word.trim_end_matches(|c| {
                if let Some(flag) = suffix_flag(c) {
                    flags |= flag;
                    true
                } else {
                    false
                }
            });
            let (_, implied) = parse_state_word(word);
            flags |= implied;
        }

        if flags.contains(NodeStateFlags::DRAIN) && base == NodeState::Idle {
            base = NodeState::Drain;
        }

        Some((base, flags))
    }

    /// Whether a node in this state, with these flags, can take new work
    pub fn is_accessible(&self, flags: NodeStateFlags) -> bool {
        let base_ok = matches!(
            self,
            NodeState::Idle | NodeState::Allocated | NodeState::Mixed
        );
        base_ok && !flags.intersects(INACCESSIBLE)
    }
}

/// Renders a state the way the reports print it, e.g. `IDLE+DRAIN+NOT_RESPONDING`
pub fn describe_state(state: &NodeState, flags: NodeStateFlags) -> String {
    let mut parts = vec![state.to_string()];
    parts.extend(
        flags
            .iter_names()
            .filter(|(name, _)| !(*name == "DRAIN" && *state == NodeState::Drain))
            .map(|(name, _)| name.to_string()),
    );
    parts.join("+")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_states() {
        assert_eq!(
            NodeState::parse("idle"),
            Some((NodeState::Idle, NodeStateFlags::empty()))
        );
        assert_eq!(
            NodeState::parse("MIXED"),
            Some((NodeState::Mixed, NodeStateFlags::empty()))
        );
        assert_eq!(
            NodeState::parse("alloc"),
            Some((NodeState::Allocated, NodeStateFlags::empty()))
        );
        assert_eq!(NodeState::parse("   "), None);
    }

    #[test]
    fn suffixes_become_flags() {
        let (state, flags) = NodeState::parse("down*").unwrap();
        assert_eq!(state, NodeState::Down);
        assert_eq!(flags, NodeStateFlags::NOT_RESPONDING);

        let (state, flags) = NodeState::parse("idle~").unwrap();
        assert_eq!(state, NodeState::Idle);
        assert!(flags.contains(NodeStateFlags::POWERED_DOWN));
    }

    #[test]
    fn drained_idle_nodes_are_drain() {
        let (state, flags) = NodeState::parse("idle+drain").unwrap();
        assert_eq!(state, NodeState::Drain);
        assert!(flags.contains(NodeStateFlags::DRAIN));

        let (state, _) = NodeState::parse("drained").unwrap();
        assert_eq!(state, NodeState::Drain);

        // a draining node still runs jobs, so its base state survives
        let (state, flags) = NodeState::parse("mixed+drain").unwrap();
        assert_eq!(state, NodeState::Mixed);
        assert!(flags.contains(NodeStateFlags::DRAIN));
    }

    #[test]
    fn unknown_base_is_kept() {
        let (state, _) = NodeState::parse("future").unwrap();
        assert_eq!(state, NodeState::Unknown("future".to_string()));
    }

    #[test]
    fn accessibility() {
        let check = |raw: &str| {
            let (state, flags) = NodeState::parse(raw).unwrap();
            state.is_accessible(flags)
        };
        assert!(check("idle"));
        assert!(check("mixed"));
        assert!(check("allocated+completing"));
        assert!(check("idle+reserved"));
        assert!(!check("down"));
        assert!(!check("down*"));
        assert!(!check("drain*"));
        assert!(!check("drng"));
        assert!(!check("mixed+drain"));
        assert!(!check("idle$"));
        assert!(!check("future"));
    }

    #[test]
    fn describe() {
        let (state, flags) = NodeState::parse("idle+drain*").unwrap();
        assert_eq!(describe_state(&state, flags), "DRAIN+NOT_RESPONDING");

        let (state, flags) = NodeState::parse("mix").unwrap();
        assert_eq!(describe_state(&state, flags), "MIXED");
    }
}
