//! Changing the identity child processes run as.

use nix::{
    errno::Errno,
    unistd::{getgid, getuid, setgid, setuid, Gid, Group, Uid, User},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug,Error)]
pub enum PrivilegeError
{
    #[error("{0} is not a valid user")]
    UnknownUser(String),
    #[error("{0} is not a valid group")]
    UnknownGroup(String),
    #[error("Could not look up user or group: {0}")]
    Lookup(Errno),
    #[error("You do not have permission to change to uid {uid}, gid {gid}")]
    PermissionDenied { uid: u32, gid: u32 },
}

impl PrivilegeError
{
    pub fn exit_code(&self) -> i32
    {
        match self
        {
            Self::UnknownUser(_) | Self::UnknownGroup(_) | Self::Lookup(_) => exitcode::USAGE,
            Self::PermissionDenied { .. } => exitcode::NOPERM,
        }
    }
}

/// The numeric identity to switch to.
#[derive(Clone,Copy,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub struct Privileges
{
    pub uid: u32,
    pub gid: u32,
}

impl Privileges
{
    /// Resolve configured user and group names. Returns `None` when neither
    /// is set; if only one is, the other stays as the current id.
    pub fn resolve(user: Option<&str>, group: Option<&str>) -> Result<Option<Self>, PrivilegeError>
    {
        if user.is_none() && group.is_none()
        {
            return Ok(None);
        }

        let uid = match user
        {
            Some(name) => User::from_name(name).map_err(PrivilegeError::Lookup)?
                                               .ok_or_else(|| PrivilegeError::UnknownUser(name.to_string()))?
                                               .uid,
            None => getuid(),
        };
        let gid = match group
        {
            Some(name) => Group::from_name(name).map_err(PrivilegeError::Lookup)?
                                                .ok_or_else(|| PrivilegeError::UnknownGroup(name.to_string()))?
                                                .gid,
            None => getgid(),
        };

        Ok(Some(Self { uid: uid.as_raw(), gid: gid.as_raw() }))
    }

    /// Switch group, then user. Only makes system calls, so it is safe to use
    /// between `fork` and `exec`.
    pub fn apply(&self) -> nix::Result<()>
    {
        setgid(Gid::from_raw(self.gid))?;
        setuid(Uid::from_raw(self.uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_configured() {
        assert_eq!(Privileges::resolve(None, None).unwrap(), None);
    }

    #[test]
    fn unknown_names() {
        let err = Privileges::resolve(Some("no-such-user-for-blackhole"), None).unwrap_err();
        assert!(matches!(err, PrivilegeError::UnknownUser(_)));
        assert_eq!(err.exit_code(), exitcode::USAGE);

        let err = Privileges::resolve(None, Some("no-such-group-for-blackhole")).unwrap_err();
        assert!(matches!(err, PrivilegeError::UnknownGroup(_)));
    }

    #[test]
    fn root_group_resolves() {
        let privileges = Privileges::resolve(None, Some("root")).unwrap().unwrap();
        assert_eq!(privileges.gid, 0);
        assert_eq!(privileges.uid, getuid().as_raw());
    }

    #[test]
    fn permission_denied() {
        assert_eq!(PrivilegeError::PermissionDenied { uid: 1, gid: 1 }.exit_code(), exitcode::NOPERM);
    }
}
