use std::collections::BTreeSet;
use std::fmt;

/// Produces the [`Location`] of the enclosing function.
///
/// The function name is recovered from the type name of a throwaway closure,
/// so this works in both sync and async functions without any runtime cost
/// beyond a few suffix comparisons.
#[macro_export]
macro_rules! location {
    () => {{
        fn type_name_of_val<T: ?Sized>(_: &T) -> &'static str {
            core::any::type_name::<T>()
        }
        let mut fn_name = type_name_of_val(&|| {});
        while let Some(stripped) = fn_name.strip_suffix("::{{closure}}") {
            fn_name = stripped;
        }
        $crate::Location {
            fn_name,
            file_name: file!(),
            line_no: line!(),
            col_no: column!(),
        }
    }};
}

/// Wraps a future such that it appears in captured activity stacks.
///
/// ```
/// # async fn doc() {
/// async_sanitizer::frame!(async {
///     // this stretch shows up as a frame in blocking reports
/// })
/// .await;
/// # }
/// ```
#[macro_export]
macro_rules! frame {
    ($future:expr) => {
        $crate::location!().frame($future)
    };
}

/// A single frame descriptor: where a monitored stretch of code lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// Fully-qualified name of the function containing the frame.
    pub fn_name: &'static str,
    /// Source file of the frame.
    pub file_name: &'static str,
    /// 1-based line of the frame.
    pub line_no: u32,
    /// 1-based column of the frame.
    pub col_no: u32,
}

impl Location {
    /// Includes `future` in captured activity stacks under this location.
    ///
    /// This is what `#[tracked]` and [`frame!`](crate::frame) expand to.
    pub fn frame<F>(self, future: F) -> crate::Tracked<F> {
        crate::Tracked::new(future, self)
    }

    pub(crate) fn from_caller(
        fn_name: &'static str,
        caller: &'static std::panic::Location<'static>,
    ) -> Self {
        Location {
            fn_name,
            file_name: caller.file(),
            line_no: caller.line(),
            col_no: caller.column(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {}:{}:{}",
            self.fn_name, self.file_name, self.line_no, self.col_no
        )
    }
}

/// The call site a scope (or one of its findings) is attributed to.
///
/// `related_files` accumulates the distinct source files seen on captured
/// activity stacks while the scope ran; it is reporting data only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub file: &'static str,
    pub function: &'static str,
    pub line: Option<u32>,
    pub related_files: BTreeSet<&'static str>,
}

impl CallerContext {
    pub(crate) fn from_location(location: Location) -> Self {
        CallerContext {
            file: location.file_name,
            function: location.fn_name,
            line: Some(location.line_no),
            related_files: BTreeSet::new(),
        }
    }

    pub(crate) fn from_runtime_caller(caller: &'static std::panic::Location<'static>) -> Self {
        CallerContext {
            file: caller.file(),
            function: "<scope>",
            line: Some(caller.line()),
            related_files: BTreeSet::new(),
        }
    }

    /// Records every file appearing in `stack` as related to this context.
    pub(crate) fn absorb_stack(&mut self, stack: &[Location]) {
        self.related_files
            .extend(stack.iter().map(|location| location.file_name));
    }
}

impl fmt::Display for CallerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.file, self.function)?;
        match self.line {
            Some(line) => write!(f, "{line}"),
            None => write!(f, "?"),
        }
    }
}
