// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Drops root back to the invoking user's uid/gid once every worker has
//! finished opening its backend. Only meaningful when the reflector was
//! started as root to open a raw socket or attach a filter program; a
//! no-op failure path just means the caller stays root.

use libc::{gid_t, setgid, setuid, uid_t};
use std::io;

fn get_saved_ids() -> Result<(uid_t, gid_t), String> {
    use libc::{getlogin, getpwnam};

    let uname = unsafe { getlogin() };
    if uname.is_null() {
        return Err("NULL from getlogin".to_owned());
    }
    let userinfo = unsafe { getpwnam(uname) };
    if userinfo.is_null() {
        return Err("NULL from getpwnam".to_owned());
    }

    let saved_gid = unsafe { (*userinfo).pw_gid };
    let saved_uid = unsafe { (*userinfo).pw_uid };

    Ok((saved_uid, saved_gid))
}

pub fn drop_privileges() -> Result<(), String> {
    let (saved_uid, saved_gid) = get_saved_ids()?;

    if -1 == unsafe { setgid(saved_gid) } {
        return Err(io::Error::last_os_error().to_string());
    }

    if -1 == unsafe { setuid(saved_uid) } {
        return Err(io::Error::last_os_error().to_string());
    }

    // Confirm root can't be reacquired before reporting success.
    if unsafe { (setgid(0) != -1) || (setuid(0) != -1) } {
        Err("failed to permanently drop privileges".to_owned())
    } else {
        Ok(())
    }
}
