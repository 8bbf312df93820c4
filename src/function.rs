//! Getting at the machine code behind a function value.
//!
//! Whatever address is handed out here has to stay valid for as long as a
//! patch on it is alive: the code must not be unloaded (for example by
//! `dlclose`) while it is redirected.

/// Something with a stable entry address.
pub trait FunctionAddress {
    fn entry_address(&self) -> usize;
}

/// A bare code address, e.g. from `dlsym`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawFunction(pub usize);

impl FunctionAddress for RawFunction {
    fn entry_address(&self) -> usize {
        self.0
    }
}

impl<T: FunctionAddress + ?Sized> FunctionAddress for &T {
    fn entry_address(&self) -> usize {
        (**self).entry_address()
    }
}

macro_rules! impl_function_address {
    ($($arg:ident),*) => {
        impl<R, $($arg),*> FunctionAddress for fn($($arg),*) -> R {
            fn entry_address(&self) -> usize {
                *self as usize
            }
        }
        impl<R, $($arg),*> FunctionAddress for unsafe fn($($arg),*) -> R {
            fn entry_address(&self) -> usize {
                *self as usize
            }
        }
        impl<R, $($arg),*> FunctionAddress for extern "C" fn($($arg),*) -> R {
            fn entry_address(&self) -> usize {
                *self as usize
            }
        }
        impl<R, $($arg),*> FunctionAddress for unsafe extern "C" fn($($arg),*) -> R {
            fn entry_address(&self) -> usize {
                *self as usize
            }
        }
    };
}

impl_function_address!();
impl_function_address!(A);
impl_function_address!(A, B);
impl_function_address!(A, B, C);
impl_function_address!(A, B, C, D);
impl_function_address!(A, B, C, D, E);
impl_function_address!(A, B, C, D, E, F);
