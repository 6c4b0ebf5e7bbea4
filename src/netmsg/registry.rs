use rustc_hash::FxHashMap;
use tracing::trace;

use crate::netmsg::{Message, Op};


pub type MessageFactory = fn() -> Box<dyn Message>;

/// Framing information for an opcode, fixed when the message type is registered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageKind {
    /// Payload size is the same for every instance, so it can be skipped without a decoder.
    Static(usize),
    /// Size depends on the content (and possibly on the codec state).
    Dynamic,
}

impl MessageKind {
    pub fn static_len(&self) -> Option<usize> {
        match self {
            MessageKind::Static(len) => Some(*len),
            MessageKind::Dynamic => None,
        }
    }
}

#[derive(Clone, Copy)]
struct Entry {
    factory: MessageFactory,
    kind: MessageKind,
}

#[derive(Default)]
struct OpTable {
    entries: FxHashMap<Op, Entry>,
}

impl OpTable {
    fn register<M: Message + Default>(&mut self, table_name: &str, dynamic: bool) {
        let template = M::default();
        let op = template.net_op();
        if self.entries.contains_key(&op) {
            panic!("{:?} is already registered in the {} table", op, table_name);
        }

        let kind = if dynamic {
            MessageKind::Dynamic
        }
        else {
            MessageKind::Static(template.encode_size())
        };
        trace!("registering {:?} as {:?} in the {} table", op, kind, table_name);

        self.entries.insert(op, Entry {
            factory: || Box::new(M::default()),
            kind,
        });
    }
}


/// Collects message types before any port exists. Registration order does not matter, but an
///  opcode can be claimed only once per table.
#[derive(Default)]
pub struct RegistryBuilder {
    global: OpTable,
    client: OpTable,
    server: OpTable,
    known_len: FxHashMap<Op, usize>,
}

impl RegistryBuilder {
    pub fn new() -> RegistryBuilder {
        Default::default()
    }

    /// Registers a message type whose layout is the same in both directions.
    ///
    /// Panics if the opcode is already registered.
    pub fn register<M: Message + Default>(mut self, dynamic: bool) -> RegistryBuilder {
        self.global.register::<M>("global", dynamic);
        self
    }

    /// Registers the layout an opcode has when it is received by a client (i.e. sent by a server).
    pub fn register_client<M: Message + Default>(mut self, dynamic: bool) -> RegistryBuilder {
        self.client.register::<M>("client", dynamic);
        self
    }

    /// Registers the layout an opcode has when it is received by a server.
    pub fn register_server<M: Message + Default>(mut self, dynamic: bool) -> RegistryBuilder {
        self.server.register::<M>("server", dynamic);
        self
    }

    /// Declares the payload length of an opcode that has no message type in this crate, so
    ///  that it can be framed as [crate::netmsg::Unknown] without swallowing the rest of the datagram.
    pub fn known_len(mut self, op: Op, len: usize) -> RegistryBuilder {
        self.known_len.insert(op, len);
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            global: self.global,
            client: self.client,
            server: self.server,
            known_len: self.known_len,
        }
    }
}


/// Immutable opcode table shared by all codec states of a process.
pub struct Registry {
    global: OpTable,
    client: OpTable,
    server: OpTable,
    known_len: FxHashMap<Op, usize>,
}

impl Registry {
    fn lookup_entry(&self, op: Op, is_client: bool) -> Option<&Entry> {
        if let Some(entry) = self.global.entries.get(&op) {
            return Some(entry);
        }
        if is_client {
            self.client.entries.get(&op)
        }
        else {
            self.server.entries.get(&op)
        }
    }

    /// Creates a fresh instance of the type registered for `op`, preferring the global table.
    pub fn lookup(&self, op: Op, is_client: bool) -> Option<(Box<dyn Message>, MessageKind)> {
        self.lookup_entry(op, is_client)
            .map(|e| ((e.factory)(), e.kind))
    }

    pub fn kind(&self, op: Op, is_client: bool) -> Option<MessageKind> {
        self.lookup_entry(op, is_client)
            .map(|e| e.kind)
    }

    /// Best-effort payload length of `op`, used to frame unregistered messages.
    pub fn op_len(&self, op: Op) -> Option<usize> {
        if let Some(entry) = self.global.entries.get(&op) {
            return entry.kind.static_len();
        }
        if let Some(len) = self.known_len.get(&op) {
            return Some(*len);
        }
        self.client.entries.get(&op)
            .or_else(|| self.server.entries.get(&op))
            .and_then(|e| e.kind.static_len())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::binenc::{check_capacity, check_len};
    use crate::message_common;

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Fixed3 {
        data: [u8; 3],
    }

    impl Message for Fixed3 {
        fn net_op(&self) -> Op {
            Op(200)
        }

        fn encode_size(&self) -> usize {
            3
        }

        fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
            check_capacity(buf, 3)?;
            buf[..3].copy_from_slice(&self.data);
            Ok(3)
        }

        fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
            check_len(data, 3)?;
            self.data.copy_from_slice(&data[..3]);
            Ok(3)
        }

        message_common!();
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Role1 {
        v: u8,
    }

    impl Message for Role1 {
        fn net_op(&self) -> Op {
            Op(201)
        }

        fn encode_size(&self) -> usize {
            1
        }

        fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
            check_capacity(buf, 1)?;
            buf[0] = self.v;
            Ok(1)
        }

        fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
            check_len(data, 1)?;
            self.v = data[0];
            Ok(1)
        }

        message_common!();
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Role2 {
        v: u16,
    }

    impl Message for Role2 {
        fn net_op(&self) -> Op {
            Op(201)
        }

        fn encode_size(&self) -> usize {
            2
        }

        fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
            check_capacity(buf, 2)?;
            buf[..2].copy_from_slice(&self.v.to_le_bytes());
            Ok(2)
        }

        fn decode(&mut self, data: &[u8]) -> anyhow::Result<usize> {
            check_len(data, 2)?;
            self.v = u16::from_le_bytes([data[0], data[1]]);
            Ok(2)
        }

        message_common!();
    }

    fn registry() -> Registry {
        RegistryBuilder::new()
            .register::<Fixed3>(false)
            .register_client::<Role1>(false)
            .register_server::<Role2>(false)
            .known_len(Op(202), 7)
            .build()
    }

    #[rstest]
    #[case::global_as_client(Op(200), true, Some(MessageKind::Static(3)))]
    #[case::global_as_server(Op(200), false, Some(MessageKind::Static(3)))]
    #[case::client_table(Op(201), true, Some(MessageKind::Static(1)))]
    #[case::server_table(Op(201), false, Some(MessageKind::Static(2)))]
    #[case::known_len_only(Op(202), true, None)]
    #[case::unregistered(Op(203), false, None)]
    fn test_kind(#[case] op: Op, #[case] is_client: bool, #[case] expected: Option<MessageKind>) {
        assert_eq!(registry().kind(op, is_client), expected);
    }

    #[test]
    fn test_lookup_role() {
        let registry = registry();
        let (msg, _) = registry.lookup(Op(201), true).unwrap();
        assert!(msg.is::<Role1>());
        let (msg, _) = registry.lookup(Op(201), false).unwrap();
        assert!(msg.is::<Role2>());
    }

    #[rstest]
    #[case::global(Op(200), Some(3))]
    #[case::known(Op(202), Some(7))]
    #[case::role_table(Op(201), Some(1))]
    #[case::nothing(Op(203), None)]
    fn test_op_len(#[case] op: Op, #[case] expected: Option<usize>) {
        assert_eq!(registry().op_len(op), expected);
    }

    #[test]
    fn test_dynamic_has_no_len() {
        let registry = RegistryBuilder::new()
            .register::<Fixed3>(true)
            .build();
        assert_eq!(registry.kind(Op(200), false), Some(MessageKind::Dynamic));
        assert_eq!(registry.op_len(Op(200)), None);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_global() {
        let _ = RegistryBuilder::new()
            .register::<Role1>(false)
            .register::<Role2>(false);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_client() {
        let _ = RegistryBuilder::new()
            .register_client::<Role1>(false)
            .register_client::<Role2>(false);
    }
}
