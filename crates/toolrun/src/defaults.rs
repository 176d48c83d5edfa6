//! Arguments a command always gets, appended after the caller's own.

use std::collections::HashMap;
use std::sync::LazyLock;

static BUILTIN: LazyLock<DefaultArgs> = LazyLock::new(|| {
    let mut table = DefaultArgs::default();
    // wasm-opt writes to a named file unless told to use stdout.
    table.insert("wasm-opt", ["--output=-"]);
    table
});

/// Command name → trailing arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultArgs {
    table: HashMap<String, Vec<String>>,
}

impl DefaultArgs {
    /// The table every [`Runner`](crate::Runner) starts from.
    pub fn builtin() -> &'static DefaultArgs {
        &BUILTIN
    }

    pub fn insert<I, S>(&mut self, command: &str, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.table
            .insert(command.to_owned(), args.into_iter().map(Into::into).collect());
    }

    /// Trailing arguments for `command`; empty when it has none.
    pub fn for_command(&self, command: &str) -> &[String] {
        self.table.get(command).map(Vec::as_slice).unwrap_or_default()
    }
}
