//! Superuser elevation, account lookup, the chroot jail, and the one-way
//! privilege drop.

use crate::error::Error;
use nix::unistd::{self, chdir, chroot, getuid, setuid, Gid, Uid, User};
use std::path::PathBuf;

/// Resolved record for the unprivileged account workers run as.
#[derive(Clone, Debug)]
pub struct Account {
    /// Account name.
    pub name: String,
    /// User ID.
    pub uid: Uid,
    /// Primary group ID.
    pub gid: Gid,
    /// Home directory, which doubles as the jail root.
    pub home: PathBuf,
}

/// Elevate to the superuser, or fail if the process cannot.
///
/// The listener must be root: it binds the port as root and workers drop
/// privileges only after they fork.
pub fn ensure_superuser() -> Result<(), Error> {
    setuid(Uid::from_raw(0)).map_err(|_| Error::PermissionDenied)?;

    // Double check that we are root.
    if !getuid().is_root() {
        return Err(Error::PermissionDenied);
    }

    Ok(())
}

/// Look up the named account in the system user database.
pub fn resolve_account(name: &str) -> Result<Account, Error> {
    let user =
        User::from_name(name)?.ok_or_else(|| Error::UserNotFound(name.to_string().into()))?;

    Ok(Account {
        name: user.name,
        uid: user.uid,
        gid: user.gid,
        home: user.dir,
    })
}

/// Change directory to the account's home, chroot there, and change
/// directory to the account's home again, this time resolved inside the
/// new root.
///
/// The second chdir means the filesystem must contain a self-nested copy
/// of the home directory: for a home of `/home/ctf` there must be a
/// `/home/ctf/home/ctf`.  This is a deployment contract, not something the
/// harness papers over.
pub fn enter_jail(account: &Account) -> Result<(), Error> {
    // Change directory FIRST, then chroot, then chdir again.
    chdir(&account.home).map_err(|err| Error::Jail("chdir", err))?;
    chroot(&account.home).map_err(|err| Error::Jail("chroot", err))?;
    chdir(&account.home).map_err(|err| Error::Jail("chdir", err))?;

    Ok(())
}

/// Reduce privileges from root to the given account and verify the drop
/// cannot be undone.
pub fn drop_privileges(account: &Account) -> Result<(), Error> {
    // Reset the supplementary groups to the account's primary group.
    #[cfg(not(any(target_os = "ios", target_os = "macos", target_os = "redox")))]
    unistd::setgroups(&[account.gid]).map_err(|err| Error::Privdrop("setgroups", err.into()))?;

    // Drop the privileges.
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "android", target_os = "freebsd",
                     target_os = "linux", target_os = "openbsd"))] {
            unistd::setresgid(account.gid, account.gid, account.gid)
                .map_err(|err| Error::Privdrop("setresgid", err.into()))?;
            unistd::setresuid(account.uid, account.uid, account.uid)
                .map_err(|err| Error::Privdrop("setresuid", err.into()))?;
        } else {
            unistd::setegid(account.gid).map_err(|err| Error::Privdrop("setegid", err.into()))?;
            unistd::setgid(account.gid).map_err(|err| Error::Privdrop("setgid", err.into()))?;
            #[cfg(not(any(target_os = "ios", target_os = "macos")))]
            unistd::seteuid(account.uid).map_err(|err| Error::Privdrop("seteuid", err.into()))?;
            unistd::setuid(account.uid).map_err(|err| Error::Privdrop("setuid", err.into()))?;
        }
    }

    // If root can be restored, the drop failed.
    if setuid(Uid::from_raw(0)).is_ok() {
        return Err(Error::Privdrop(
            "setuid",
            format!("root privileges restored: {}", getuid()).into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::resolve_account;
    use crate::error::Error;

    #[test]
    fn test_resolve_root() {
        let account = resolve_account("root").expect("root must exist");
        assert_eq!(account.name, "root");
        assert!(account.uid.is_root());
    }

    #[test]
    fn test_resolve_unknown() {
        match resolve_account("no-such-user-420") {
            Err(Error::UserNotFound(name)) => assert_eq!(name, "no-such-user-420"),
            other => panic!("expected UserNotFound, got {:?}", other),
        }
    }
}
