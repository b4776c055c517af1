#![allow(unused_macros)]

macro_rules! ok_or_errno {
    ($success:expr => $($scb:tt)+) => {
        if $success {
            Ok($($scb)+)
        } else {
            Err(::std::io::Error::last_os_error())
        }
    };
}

macro_rules! builder_must_use {
    () => {
        "builder setters take the entire structure and return the result"
    };
}

macro_rules! builder_setters {
    ($(#[doc = $($doc:tt)+])* $name:ident : $ty:ty) => {
        $(#[doc = $($doc)+])*
        #[must_use = builder_must_use!()]
        #[inline(always)]
        pub fn $name(mut self, $name: $ty) -> Self {
            self.$name = $name;
            self
        }
    };
    ($($(#[doc = $($doc:tt)+])* $name:ident : $ty:ty),+ $(,)?) => {$(
        builder_setters!($(#[doc = $($doc)+])* $name: $ty);
    )+};
}

/// Implements the fd ownership traits for a type whose descriptor is reachable through the given
/// field path.
macro_rules! forward_as_fd {
    ($ty:ty, $($field:tt).+) => {
        impl ::std::os::fd::AsFd for $ty {
            #[inline]
            fn as_fd(&self) -> ::std::os::fd::BorrowedFd<'_> { self.$($field).+.as_fd() }
        }
        impl ::std::os::fd::AsRawFd for $ty {
            #[inline]
            fn as_raw_fd(&self) -> ::std::os::fd::RawFd { self.$($field).+.as_raw_fd() }
        }
    };
}
