use std::{
    env::{var as env_var, var_os as env_var_os},
    io::{self, Write},
};

fn main() {
    if is_unix() {
        let target = TargetTriplet::fetch();
        collect_uds_features(&target);
    }
}

fn is_unix() -> bool {
    env_var_os("CARGO_CFG_UNIX").is_some()
}

/// This can define the following:
/// - `uds_supported`
/// - Address layout flavor:
///     - `uds_sun_len`, a one-byte `sun_len` prefix followed by a one-byte family, on the BSD
///       family; absent means a two-byte `sun_family` with no length byte
/// - Address length flavors:
///     - `uds_sockaddr_un_len_108`
///     - `uds_sockaddr_un_len_104`, on the BSD family
///     - `uds_sockaddr_un_len_126`, only on Haiku
/// - `cmsghdr`'s `cmsg_len` type:
///     - `uds_cmsghdr_len_socklen_t`
///     - `uds_cmsghdr_len_size_t`, on Linux with GNU, Android, uClibc MIPS64, and uClibc x86-64
/// - `uds_cmsg_cloexec`, support for `MSG_CMSG_CLOEXEC` on `recvmsg`
/// - `uds_msg_nosignal`, support for `MSG_NOSIGNAL` on `sendmsg`
#[rustfmt::skip]
fn collect_uds_features(target: &TargetTriplet) {
    let mut uds = false;
    if (target.os("linux") && target.env_any(&["gnu", "musl", "musleabi", "musleabihf"]))
    || target.os_any(&["android", "emscripten", "fuchsia", "redox"]) {
        // "Linux-like" in libc terminology, plus Fuchsia and Redox
        uds = true;
        define("uds_sockaddr_un_len_108");
        if (target.os("linux") && target.env("gnu"))
        || (target.os("linux") && target.env("uclibc") && target.arch_any(&["x86_64", "mips64"]))
        || target.os("android") {
            define("uds_cmsghdr_len_size_t");
        } else {
            define("uds_cmsghdr_len_socklen_t");
        }
        if target.os_any(&["linux", "android"]) {
            ldefine(&["uds_cmsg_cloexec", "uds_msg_nosignal"]);
        }
    } else if target.os_any(&["freebsd", "openbsd", "netbsd", "dragonfly", "macos", "ios"]) {
        // The BSD OS family
        uds = true;
        ldefine(&["uds_sockaddr_un_len_104", "uds_sun_len", "uds_cmsghdr_len_socklen_t"]);
        if target.os("freebsd") {
            ldefine(&["uds_cmsg_cloexec", "uds_msg_nosignal"]);
        }
    } else if target.os_any(&["solaris", "illumos"]) {
        uds = true;
        ldefine(&["uds_sockaddr_un_len_108", "uds_cmsghdr_len_socklen_t"]);
    } else if target.os("haiku") {
        uds = true;
        ldefine(&["uds_sockaddr_un_len_126", "uds_sun_len", "uds_cmsghdr_len_socklen_t"]);
    }
    if uds {
        define("uds_supported");
    }
}

fn define(cfg: &str) {
    ldefine(&[cfg]);
}
fn ldefine(cfgs: &[&str]) {
    let stdout_ = io::stdout();
    let mut stdout = stdout_.lock();
    for i in cfgs {
        stdout.write_all(b"cargo:rustc-cfg=").unwrap();
        stdout.write_all(i.as_ref()).unwrap();
        stdout.write_all(b"\n").unwrap();
    }
}

struct TargetTriplet {
    arch: String,
    os: String,
    env: Option<String>,
}
#[rustfmt::skip]
impl TargetTriplet {
    fn fetch() -> Self {
        Self {
            arch: env_var("CARGO_CFG_TARGET_ARCH").unwrap(),
            os: env_var("CARGO_CFG_TARGET_OS").unwrap(),
            env: env_var("CARGO_CFG_TARGET_ENV").ok(),
        }
    }
    fn arch_any(&self, arches: &[&str]) -> bool { arches.iter().copied().any(|x| x == self.arch) }
    fn os(&self, os: &str) -> bool { self.os == os }
    fn os_any(&self, oses: &[&str]) -> bool { oses.iter().copied().any(|x| x == self.os) }
    fn env(&self, env: &str) -> bool { self.env.as_deref() == Some(env) }
    fn env_any(&self, envs: &[&str]) -> bool {
        if let Some(env) = self.env.as_deref() {
            envs.iter().copied().any(|x| x == env)
        } else { false }
    }
}
