//! POSIX ACL text parsing and binary xattr encoding.
//!
//! Converts textual ACL specifications (the `setfacl` entry grammar) into the
//! exact byte layout the kernel expects for `system.posix_acl_access`. The
//! sort order and the equivalent-to-mode rule are compatible with libacl, so
//! encodings can be compared byte-for-byte against `acl_to_xattr`.

use std::fmt;

// ACL permission bits
const ACL_READ: u16 = 0x04;
const ACL_WRITE: u16 = 0x02;
const ACL_EXECUTE: u16 = 0x01;

// Extended attribute layout version
const ACL_EA_VERSION: u32 = 0x0002;

/// Qualifier value for entries without one (`*_OBJ`, mask, other).
pub const ACL_UNDEFINED_ID: u32 = 0xffff_ffff;

/// ACL entry tag, with the on-disk tag values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum AclTag {
    UserObj = 0x01,
    User = 0x02,
    GroupObj = 0x04,
    Group = 0x08,
    Mask = 0x10,
    Other = 0x20,
}

impl AclTag {
    fn is_qualified(self) -> bool {
        matches!(self, AclTag::User | AclTag::Group)
    }
}

/// A single parsed ACL entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AclEntry {
    pub tag: AclTag,
    pub id: u32,
    pub perm: u16,
}

impl AclEntry {
    // Sorting compatible with libacl: by tag, then by qualifier.
    fn sort_key(&self) -> (u16, u32) {
        (self.tag as u16, self.id)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.tag as u16).to_le_bytes());
        out.extend_from_slice(&self.perm.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
    }
}

impl fmt::Debug for AclEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AclEntry({:?}:{:#x}:{:#o})", self.tag, self.id, self.perm)
    }
}

/// Resolves symbolic user/group qualifiers to numeric ids.
pub trait NameResolver {
    fn uid_of(&self, name: &str) -> Option<u32>;
    fn gid_of(&self, name: &str) -> Option<u32>;
}

/// Resolver backed by the system user/group database.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl NameResolver for SystemResolver {
    fn uid_of(&self, name: &str) -> Option<u32> {
        nix::unistd::User::from_name(name)
            .ok()
            .flatten()
            .map(|u| u.uid.as_raw())
    }

    fn gid_of(&self, name: &str) -> Option<u32> {
        nix::unistd::Group::from_name(name)
            .ok()
            .flatten()
            .map(|g| g.gid.as_raw())
    }
}

/// Result of encoding a textual ACL.
#[derive(Clone, Debug)]
pub struct EncodedAcl {
    /// Binary `system.posix_acl_access` value; empty iff the ACL is
    /// equivalent to traditional mode bits.
    pub bytes: Vec<u8>,
    /// True when the ACL carries no qualified user/group entries.
    pub equivalent_to_mode: bool,
}

/// Encode a textual ACL using the system user/group database.
pub fn acl_from_text(text: &str) -> crate::Result<EncodedAcl> {
    acl_from_text_with(text, &SystemResolver)
}

/// Encode a textual ACL with an explicit qualifier resolver.
pub fn acl_from_text_with(text: &str, resolver: &dyn NameResolver) -> crate::Result<EncodedAcl> {
    let entries = parse_entries(text, resolver)?;

    let equivalent_to_mode = !entries.iter().any(|e| e.tag.is_qualified());
    if equivalent_to_mode {
        // Nothing but the usual u/g/o bits: no binary value is stored,
        // mimicking libacl's acl_equiv_mode.
        return Ok(EncodedAcl {
            bytes: Vec::new(),
            equivalent_to_mode: true,
        });
    }

    let mut bytes = Vec::with_capacity(4 + entries.len() * 8);
    bytes.extend_from_slice(&ACL_EA_VERSION.to_le_bytes());
    for entry in &entries {
        entry.encode_into(&mut bytes);
    }
    Ok(EncodedAcl {
        bytes,
        equivalent_to_mode: false,
    })
}

/// Parse, sort, and validate the entries of a textual ACL.
pub fn parse_entries(text: &str, resolver: &dyn NameResolver) -> crate::Result<Vec<AclEntry>> {
    let mut entries = Vec::new();
    for raw in text.split(['\n', ',']) {
        // Drop '#'-starting comments, then surrounding whitespace. libacl
        // tolerates excess whitespace and we additionally tolerate excess
        // delimiters.
        let stripped = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let token = stripped.trim();
        if token.is_empty() {
            continue;
        }
        entries.push(entry_from_text(token, resolver)?);
    }

    entries.sort_by_key(AclEntry::sort_key);
    validate(&entries)?;
    Ok(entries)
}

fn entry_from_text(token: &str, resolver: &dyn NameResolver) -> crate::Result<AclEntry> {
    // type:qualifier:permissions
    let mut fields = token.splitn(3, ':');
    let (Some(kind), Some(qualifier), Some(perms)) =
        (fields.next(), fields.next(), fields.next())
    else {
        return Err(crate::Error::AclInvalid(format!(
            "entry needs type:qualifier:perms, got '{token}'"
        )));
    };

    let tag = match kind {
        "u" | "user" => {
            if qualifier.is_empty() {
                AclTag::UserObj
            } else {
                AclTag::User
            }
        }
        "g" | "group" => {
            if qualifier.is_empty() {
                AclTag::GroupObj
            } else {
                AclTag::Group
            }
        }
        "o" | "other" => AclTag::Other,
        "m" | "mask" => AclTag::Mask,
        _ => {
            return Err(crate::Error::AclInvalid(format!(
                "unknown entry type '{kind}'"
            )));
        }
    };

    let id = if qualifier.is_empty() {
        ACL_UNDEFINED_ID
    } else if !tag.is_qualified() {
        return Err(crate::Error::AclInvalid(format!(
            "qualifier not allowed for '{kind}'"
        )));
    } else if let Ok(numeric) = qualifier.parse::<u32>() {
        numeric
    } else {
        let resolved = match tag {
            AclTag::User => resolver.uid_of(qualifier),
            AclTag::Group => resolver.gid_of(qualifier),
            _ => unreachable!(),
        };
        resolved.ok_or_else(|| {
            crate::Error::AclInvalid(format!("cannot resolve qualifier '{qualifier}'"))
        })?
    };

    Ok(AclEntry {
        tag,
        id,
        perm: perms_from_text(perms)?,
    })
}

fn perms_from_text(perms: &str) -> crate::Result<u16> {
    // Unsupported setfacl extensions: capital X, numeric syntax.
    let mut mask = 0;
    for c in perms.chars() {
        match c {
            'r' => mask |= ACL_READ,
            'w' => mask |= ACL_WRITE,
            'x' => mask |= ACL_EXECUTE,
            '-' => {}
            _ => {
                return Err(crate::Error::AclInvalid(format!(
                    "invalid permission character '{c}'"
                )));
            }
        }
    }
    Ok(mask)
}

/// The acl_valid(3) rules, over a sorted entry list.
fn validate(entries: &[AclEntry]) -> crate::Result<()> {
    let count = |tag| entries.iter().filter(|e| e.tag == tag).count();

    for tag in [AclTag::UserObj, AclTag::GroupObj, AclTag::Other] {
        if count(tag) != 1 {
            return Err(crate::Error::AclInvalid(format!(
                "exactly one {tag:?} entry required"
            )));
        }
    }
    if count(AclTag::Mask) > 1 {
        return Err(crate::Error::AclInvalid(
            "at most one Mask entry allowed".to_string(),
        ));
    }
    let has_qualified = entries.iter().any(|e| e.tag.is_qualified());
    if has_qualified && count(AclTag::Mask) == 0 {
        return Err(crate::Error::AclInvalid(
            "Mask entry required with named user/group entries".to_string(),
        ));
    }
    // Qualifiers must be unique among User entries and among Group entries.
    // The list is sorted by (tag, id) so duplicates are adjacent.
    for pair in entries.windows(2) {
        if pair[0].tag.is_qualified() && pair[0].sort_key() == pair[1].sort_key() {
            return Err(crate::Error::AclInvalid(format!(
                "duplicate {:?} entry for id {}",
                pair[0].tag, pair[0].id
            )));
        }
    }
    Ok(())
}
