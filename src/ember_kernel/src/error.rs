//! Result codes and per-operation error types
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use ember_kernel::ResultCode;
            /// assert_eq!(ResultCode::BadObjectState.as_str(), "BadObjectState");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the kernel can report.
    ///
    /// The values follow the μITRON 4.0 error codes where one exists.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// A parameter is invalid in a way that is no covered by any other error
        /// codes.
        BadParam = -17,
        /// The specified thread does not exist.
        NoAccess = -18,
        /// The thread table has no free slot.
        NoFreeSlot = -34,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -41,
        /// An object couldn't be enqueued because there are too many of such
        /// things that already have been enqueued.
        QueueOverflow = -43,
        /// The wait operation was canceled by another context.
        Canceled = -49,
        /// The operation timed out.
        Timeout = -50,
        /// The operation would have to block, but a non-blocking variant was
        /// requested.
        WouldBlock = -57,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(ResultCode::from(*self).as_str())
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }
    };
}

define_error! {
    mod create_thread_error {}
    /// Error type for [`Kernel::thread_create`].
    ///
    /// [`Kernel::thread_create`]: crate::Kernel::thread_create
    pub enum CreateThreadError {
        /// The priority is out of range, or the stack is empty.
        BadParam,
        /// All slots of the thread table are in use.
        NoFreeSlot,
    }
}

define_error! {
    mod no_access_error {}
    /// Error type for operations that only look up a thread.
    pub enum NoAccessError {
        /// The thread does not exist.
        NoAccess,
    }
}

define_error! {
    mod set_priority_error {}
    /// Error type for [`Kernel::set_priority`].
    ///
    /// [`Kernel::set_priority`]: crate::Kernel::set_priority
    pub enum SetPriorityError {
        /// The thread does not exist.
        NoAccess,
        /// The priority is out of range.
        BadParam,
    }
}

define_error! {
    mod wakeup_error {}
    /// Error type for [`Kernel::thread_wakeup`].
    ///
    /// [`Kernel::thread_wakeup`]: crate::Kernel::thread_wakeup
    pub enum WakeupError {
        /// The thread does not exist.
        NoAccess,
        /// The thread is not in the Sleeping state.
        BadObjectState,
    }
}

define_error! {
    mod kill_zombie_error {}
    /// Error type for [`Kernel::thread_kill_zombie`].
    ///
    /// [`Kernel::thread_kill_zombie`]: crate::Kernel::thread_kill_zombie
    pub enum KillZombieError {
        /// The thread does not exist.
        NoAccess,
        /// The thread is not a zombie.
        BadObjectState,
    }
}

define_error! {
    mod lock_mutex_error {}
    /// Error type for [`Mutex::lock`].
    ///
    /// [`Mutex::lock`]: crate::Mutex::lock
    pub enum LockMutexError {
        /// The wait was canceled by [`Mutex::cancel`].
        ///
        /// [`Mutex::cancel`]: crate::Mutex::cancel
        Canceled,
    }
}

define_error! {
    mod lock_mutex_timeout_error {}
    /// Error type for [`Mutex::lock_timeout`].
    ///
    /// [`Mutex::lock_timeout`]: crate::Mutex::lock_timeout
    pub enum LockMutexTimeoutError {
        /// The wait was canceled by [`Mutex::cancel`].
        ///
        /// [`Mutex::cancel`]: crate::Mutex::cancel
        Canceled,
        /// The mutex wasn't handed over before the timeout.
        Timeout,
    }
}

define_error! {
    mod timeout_error {}
    /// Error type for timed waits that can only fail by expiring.
    pub enum TimeoutError {
        /// The timeout expired.
        Timeout,
    }
}

define_error! {
    mod msg_init_queue_error {}
    /// Error type for [`Kernel::msg_init_queue`].
    ///
    /// [`Kernel::msg_init_queue`]: crate::Kernel::msg_init_queue
    pub enum MsgInitQueueError {
        /// The buffer is empty.
        BadParam,
        /// The calling thread already has a message queue.
        BadObjectState,
    }
}

define_error! {
    mod send_error {}
    /// Error type for [`Kernel::msg_send`] and [`Kernel::msg_send_receive`].
    ///
    /// [`Kernel::msg_send`]: crate::Kernel::msg_send
    /// [`Kernel::msg_send_receive`]: crate::Kernel::msg_send_receive
    pub enum SendError {
        /// The target thread does not exist.
        NoAccess,
        /// The target is the calling thread.
        BadParam,
    }
}

define_error! {
    mod try_send_error {}
    /// Error type for the non-blocking send operations.
    pub enum TrySendError {
        /// The target thread does not exist.
        NoAccess,
        /// The target is the calling thread.
        BadParam,
        /// The target is not waiting for a message and its queue is full or
        /// absent.
        WouldBlock,
    }
}

define_error! {
    mod try_receive_error {}
    /// Error type for [`Kernel::msg_try_receive`].
    ///
    /// [`Kernel::msg_try_receive`]: crate::Kernel::msg_try_receive
    pub enum TryReceiveError {
        /// No message is available.
        WouldBlock,
    }
}

define_error! {
    mod reply_error {}
    /// Error type for [`Kernel::msg_reply`].
    ///
    /// [`Kernel::msg_reply`]: crate::Kernel::msg_reply
    pub enum ReplyError {
        /// The original message has no sender, or the sender does not exist.
        NoAccess,
        /// The sender is not waiting for a reply, or is waiting for one from
        /// another thread.
        BadObjectState,
    }
}

define_error! {
    mod bus_error {}
    /// Error type for [`MsgBus`] operations.
    ///
    /// [`MsgBus`]: crate::MsgBus
    pub enum BusError {
        /// The message kind is not in `0..32`.
        BadParam,
        /// The calling thread is not attached to the bus, or it's already
        /// attached.
        BadObjectState,
        /// The bus has no room for another subscriber.
        QueueOverflow,
    }
}

impl From<SendError> for TrySendError {
    fn from(x: SendError) -> Self {
        match x {
            SendError::NoAccess => Self::NoAccess,
            SendError::BadParam => Self::BadParam,
        }
    }
}

impl From<NoAccessError> for SendError {
    fn from(x: NoAccessError) -> Self {
        match x {
            NoAccessError::NoAccess => Self::NoAccess,
        }
    }
}
