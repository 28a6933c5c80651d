//! Command builder and the outbound command encoder.

use crate::types::ToRedisArgs;

/// A single command, built as an ordered sequence of byte-string
/// arguments and encoded on the wire as an array of bulk strings
/// regardless of protocol level.
#[derive(Debug, Clone, Default)]
pub struct Cmd {
    args: Vec<Vec<u8>>,
}

/// Shortcut for creating a command with its name already set.
///
/// ```
/// let mut command = rudis::cmd("SET");
/// command.arg("key").arg("value");
/// ```
pub fn cmd(name: &str) -> Cmd {
    let mut command = Cmd::new();
    command.arg(name);
    command
}

impl Cmd {
    /// Creates an empty command.
    pub fn new() -> Cmd {
        Cmd { args: Vec::new() }
    }

    /// Appends an argument. Accepts anything implementing
    /// [`ToRedisArgs`] and returns `&mut self` for chaining.
    pub fn arg<T: ToRedisArgs>(&mut self, arg: T) -> &mut Cmd {
        arg.write_redis_args(&mut self.args);
        self
    }

    /// The command name (first argument), uppercased.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|name| String::from_utf8_lossy(name).to_ascii_uppercase())
            .unwrap_or_default()
    }

    /// The diagnostic label attached to the pending entry for this
    /// command: the uppercased command token, except for `KEYS` where
    /// the full joined command is used.
    pub fn label(&self) -> String {
        let name = self.name();
        if name == "KEYS" {
            let mut label = name;
            for arg in self.args.iter().skip(1) {
                label.push(' ');
                label.push_str(&String::from_utf8_lossy(arg));
            }
            label
        } else {
            name
        }
    }

    /// Encodes the command into its wire representation:
    /// `*<n>\r\n` followed by `<n>` items of `$<len>\r\n<bytes>\r\n`.
    pub fn get_packed_command(&self) -> Vec<u8> {
        let mut itoa_buf = itoa::Buffer::new();
        let payload_len: usize = self.args.iter().map(|arg| arg.len() + 16).sum();
        let mut out = Vec::with_capacity(payload_len + 16);

        out.push(b'*');
        out.extend_from_slice(itoa_buf.format(self.args.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        for arg in &self.args {
            out.push(b'$');
            out.extend_from_slice(itoa_buf.format(arg.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    /// Number of arguments, the command name included.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Iterates the raw arguments.
    pub fn args_iter(&self) -> impl Iterator<Item = &[u8]> {
        self.args.iter().map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_as_array_of_bulk_strings() {
        let mut command = cmd("SET");
        command.arg("foo").arg("bar");
        assert_eq!(
            command.get_packed_command(),
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n"
        );
    }

    #[test]
    fn packs_binary_and_numeric_args() {
        let mut command = cmd("SET");
        command.arg(b"k\x00y".as_slice()).arg(17u64);
        assert_eq!(
            command.get_packed_command(),
            b"*3\r\n$3\r\nSET\r\n$3\r\nk\x00y\r\n$2\r\n17\r\n"
        );
    }

    #[test]
    fn label_is_the_uppercased_command_token() {
        let mut command = cmd("get");
        command.arg("foo");
        assert_eq!(command.label(), "GET");
        assert_eq!(command.name(), "GET");
    }

    #[test]
    fn keys_label_includes_the_pattern() {
        let mut command = cmd("KEYS");
        command.arg("user:*");
        assert_eq!(command.label(), "KEYS user:*");
    }
}
