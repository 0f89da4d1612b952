// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// Transfer-role negotiation.
//
// Each side of a connection supports a subset of the four transfer roles
// and may express no preference, a preference, or a mandate. Both sides of
// a connection run the same pure negotiation over descriptors exchanged on
// the wire, so the algorithm must be deterministic in its inputs.

use crate::error::{Error, Result};

/// A port's position in the push/flow-control protocol.
///
/// The wire encodes the discriminant as a signed 32-bit value. `NoRole`
/// deliberately sits past the valid range; `ROLE_COUNT` is the number of
/// negotiable roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PortRole {
    /// Reads and writes messages directly at the other port.
    ActiveMessage = 0,
    /// Only tells the other port when it may act.
    ActiveFlowControl = 1,
    /// Does everything; the other port does nothing.
    ActiveOnly = 2,
    /// Does nothing; the other port does everything.
    Passive = 3,
    /// Unspecified (pre-negotiation).
    NoRole = 5,
}

/// Number of negotiable roles (valid option-mask bits 0..ROLE_COUNT).
pub const ROLE_COUNT: usize = 4;

/// Option bit: the flow-control flag carries a count, not a toggle.
pub const OPT_FEEDBACK_IS_COUNT: u32 = 1 << 4;
/// Option bit: the role field is a mandate, not a preference.
pub const OPT_MANDATED_ROLE: u32 = 1 << 5;
/// Option bit: the full-flag word carries compressed metadata.
pub const OPT_FLAG_IS_META: u32 = 1 << 6;
/// Option bit: the flag is a counter used for flow control.
pub const OPT_FLAG_IS_COUNTING: u32 = 1 << 7;
/// Option bit: flag-as-metadata is supported but not required.
pub const OPT_FLAG_IS_META_OPTIONAL: u32 = 1 << 8;

/// Pairing table: the role the peer must take for each of ours.
const OTHER_ROLES: [PortRole; ROLE_COUNT] = [
    PortRole::ActiveFlowControl, // for ActiveMessage
    PortRole::ActiveMessage,     // for ActiveFlowControl
    PortRole::Passive,           // for ActiveOnly
    PortRole::ActiveOnly,        // for Passive
];

impl PortRole {
    /// The role the peer must take when this side takes `self`.
    pub fn other(self) -> PortRole {
        assert!(self != PortRole::NoRole);
        OTHER_ROLES[self as usize]
    }

    /// The option-mask bit for this role.
    pub fn bit(self) -> u32 {
        assert!(self != PortRole::NoRole);
        1 << self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            PortRole::ActiveMessage => "ActiveMessage",
            PortRole::ActiveFlowControl => "ActiveFlowControl",
            PortRole::ActiveOnly => "ActiveOnly",
            PortRole::Passive => "Passive",
            PortRole::NoRole => "NoRole",
        }
    }

    /// Decode a wire discriminant.
    pub fn from_wire(v: i32) -> Result<PortRole> {
        Ok(match v {
            0 => PortRole::ActiveMessage,
            1 => PortRole::ActiveFlowControl,
            2 => PortRole::ActiveOnly,
            3 => PortRole::Passive,
            5 => PortRole::NoRole,
            _ => return Err(Error::Decode("invalid port role")),
        })
    }

    fn from_index(i: usize) -> PortRole {
        match i {
            0 => PortRole::ActiveMessage,
            1 => PortRole::ActiveFlowControl,
            2 => PortRole::ActiveOnly,
            3 => PortRole::Passive,
            _ => unreachable!(),
        }
    }
}

/// Parse a `transferRole` override string.
///
/// Accepted: `passive`, `active` / `activemessage`, `flowcontrol` /
/// `activeflowcontrol`, `activeonly` (case-insensitive).
pub fn parse_transfer_role(s: &str) -> Result<PortRole> {
    let l = s.to_ascii_lowercase();
    Ok(match l.as_str() {
        "passive" => PortRole::Passive,
        "active" | "activemessage" => PortRole::ActiveMessage,
        "flowcontrol" | "activeflowcontrol" => PortRole::ActiveFlowControl,
        "activeonly" => PortRole::ActiveOnly,
        _ => return Err(Error::BadRoleName(s.to_string())),
    })
}

/// If `role` is unset, default it to the first role present in `options`.
fn default_role(role: &mut PortRole, options: u32) -> Result<()> {
    if *role == PortRole::NoRole {
        for n in 0..ROLE_COUNT {
            if options & (1 << n) != 0 {
                *role = PortRole::from_index(n);
                return Ok(());
            }
        }
        return Err(Error::Negotiation("port has no transfer roles"));
    }
    Ok(())
}

/// Negotiate a compatible (user, provider) role pair in place.
///
/// "User" is the output side, "provider" the input side. Incoming roles
/// are preferences, or mandates when `OPT_MANDATED_ROLE` is set in the
/// matching options word. On success the two roles are paired opposites
/// and each appears in its own side's option mask.
///
/// Priority order:
/// 1. flag-as-metadata compatibility (hard failure on mismatch),
/// 2. mandates (peer must match or also mandate),
/// 3. preferences with push-favoring bias, then provider priority,
/// 4. exhaustive scan over the pairing table.
pub fn choose_roles(
    u_role: &mut PortRole,
    u_options: &mut u32,
    p_role: &mut PortRole,
    p_options: &mut u32,
) -> Result<()> {
    default_role(u_role, *u_options)?;
    default_role(p_role, *p_options)?;
    let p_other = p_role.other();
    let u_other = u_role.other();

    if *u_options & OPT_FLAG_IS_META != 0 {
        if *p_options & (OPT_FLAG_IS_META | OPT_FLAG_IS_META_OPTIONAL) == 0 {
            return Err(Error::Negotiation(
                "incompatible metadata mode: input side cannot do flag-is-meta, output must",
            ));
        }
        *p_options |= OPT_FLAG_IS_META;
    } else if *u_options & OPT_FLAG_IS_META_OPTIONAL != 0 {
        if *p_options & (OPT_FLAG_IS_META | OPT_FLAG_IS_META_OPTIONAL) != 0 {
            *p_options |= OPT_FLAG_IS_META;
            *u_options |= OPT_FLAG_IS_META;
        } else {
            *u_options &= !OPT_FLAG_IS_META;
        }
    } else if *p_options & OPT_FLAG_IS_META != 0 {
        return Err(Error::Negotiation(
            "incompatible metadata mode: output side cannot do flag-is-meta, input must",
        ));
    }

    if *p_options & OPT_MANDATED_ROLE != 0 {
        // Provider has a mandate.
        assert!(*p_role != PortRole::NoRole);
        if *u_role == p_other {
            return Ok(());
        }
        if *u_options & OPT_MANDATED_ROLE != 0 {
            return Err(Error::Negotiation("incompatible mandated transfer roles"));
        }
        if *u_options & p_other.bit() != 0 {
            *u_role = p_other;
            return Ok(());
        }
        return Err(Error::Negotiation(
            "no compatible role available against mandated role",
        ));
    } else if *p_role != PortRole::NoRole {
        // Provider has a preference.
        if *u_options & OPT_MANDATED_ROLE != 0 {
            // User has a mandate.
            assert!(*u_role != PortRole::NoRole);
            if *p_role == u_other {
                return Ok(());
            }
            if *p_options & u_other.bit() != 0 {
                *p_role = u_other;
                return Ok(());
            }
            return Err(Error::Negotiation(
                "no compatible role available against mandated role",
            ));
        }
        // Preferences on both sides, no mandate.
        if *p_role == u_other {
            return Ok(());
        }
        // If one preference is against push, listen to it.
        if *u_role == PortRole::ActiveFlowControl && *p_options & PortRole::ActiveMessage.bit() != 0
        {
            *p_role = PortRole::ActiveMessage;
            return Ok(());
        }
        // Try active push if we can.
        if *u_role == PortRole::ActiveMessage
            && *p_options & PortRole::ActiveFlowControl.bit() != 0
        {
            *p_role = PortRole::ActiveFlowControl;
            return Ok(());
        }
        if *p_role == PortRole::ActiveFlowControl && *u_options & PortRole::ActiveMessage.bit() != 0
        {
            *u_role = PortRole::ActiveMessage;
            return Ok(());
        }
        // Try active-only push if we can.
        if *u_role == PortRole::ActiveOnly && *p_options & PortRole::Passive.bit() != 0 {
            *p_role = PortRole::Passive;
            return Ok(());
        }
        if *p_role == PortRole::ActiveOnly && *u_options & PortRole::Passive.bit() != 0 {
            *u_role = PortRole::Passive;
            return Ok(());
        }
        // Give priority to the "better" (lower-numbered) role.
        if (*u_role as i32) < (*p_role as i32) && *p_options & u_other.bit() != 0 {
            *p_role = u_other;
            return Ok(());
        }
        // Give priority to the provider.
        if *u_options & p_other.bit() != 0 {
            *u_role = p_other;
            return Ok(());
        }
        if *p_options & u_other.bit() != 0 {
            *p_role = u_other;
            return Ok(());
        }
        // Neither preference is usable; fall through to the scan.
    } else if *u_options & OPT_MANDATED_ROLE != 0 {
        // Provider has neither mandate nor preference; user mandates.
        if *p_options & u_other.bit() != 0 {
            *p_role = u_other;
            return Ok(());
        }
        return Err(Error::Negotiation(
            "no compatible role available against mandated role",
        ));
    } else if *u_role != PortRole::NoRole {
        // Only the user has a preference.
        if *p_options & u_other.bit() != 0 {
            *p_role = u_other;
            return Ok(());
        }
        // Fall through to the scan.
    }

    // No usable mandates or preferences. Find anything, biased to push by
    // scanning in role index order.
    for n in 0..ROLE_COUNT {
        let r = PortRole::from_index(n);
        if *u_options & r.bit() != 0 && *p_options & r.other().bit() != 0 {
            *u_role = r;
            *p_role = r.other();
            return Ok(());
        }
    }
    Err(Error::Negotiation("no compatible combination of roles exist"))
}
