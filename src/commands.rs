//! The generated thin command surface.
//!
//! Each wrapper builds its command and hands it to
//! [`Connection::execute`]; nothing here adds behavior beyond argument
//! packing. `GET` and `KEYS` live on [`Connection`] directly because
//! they carry extra semantics (client-side caching, the default
//! pattern).

use crate::cmd::Cmd;
use crate::connection::Connection;
use crate::types::{RedisResult, ToRedisArgs, Value};

macro_rules! implement_commands {
    (
        $(
            $(#[$attr:meta])*
            $name:ident<$($arg:ident: $gen:ident),*>($($token:expr),+);
        )*
    ) => {
        impl Connection {
            $(
                $(#[$attr])*
                pub async fn $name<$($gen: ToRedisArgs),*>(
                    &self
                    $(, $arg: $gen)*
                ) -> RedisResult<Value> {
                    let mut command = Cmd::new();
                    $(command.arg($token);)+
                    $(command.arg($arg);)*
                    self.execute(command).await
                }
            )*
        }
    };
}

implement_commands! {
    /// Sets `key` to `value`.
    set<key: K, value: V>("SET");

    /// Removes `key`.
    del<key: K>("DEL");

    /// Whether `key` exists.
    exists<key: K>("EXISTS");

    /// Increments the integer value of `key` by one.
    incr<key: K>("INCR");

    /// Increments the integer value of `key` by `delta`.
    incrby<key: K, delta: D>("INCRBY");

    /// Decrements the integer value of `key` by one.
    decr<key: K>("DECR");

    /// Sets a time-to-live in seconds on `key`.
    expire<key: K, seconds: S>("EXPIRE");

    /// Remaining time-to-live of `key` in seconds.
    ttl<key: K>("TTL");

    /// Returns `message` unchanged.
    echo<message: M>("ECHO");

    /// Health check; allowed even in RESP2 subscriber mode.
    ping<>("PING");

    /// Publishes `payload` on `channel`, returning the number of
    /// receiving subscribers.
    publish<channel: C, payload: P>("PUBLISH");

    /// Prepends `value` to the list at `key`.
    lpush<key: K, value: V>("LPUSH");

    /// Appends `value` to the list at `key`.
    rpush<key: K, value: V>("RPUSH");

    /// Returns the list elements between `start` and `stop`.
    lrange<key: K, start: S, stop: T>("LRANGE");

    /// Sets `field` of the hash at `key` to `value`.
    hset<key: K, field: F, value: V>("HSET");

    /// Returns `field` of the hash at `key`.
    hget<key: K, field: F>("HGET");

    /// The server-assigned id of this connection.
    client_id<>("CLIENT", "ID");

    /// Renames this connection on the server.
    client_setname<name: N>("CLIENT", "SETNAME");

    /// The name this connection is known by on the server.
    client_getname<>("CLIENT", "GETNAME");
}
