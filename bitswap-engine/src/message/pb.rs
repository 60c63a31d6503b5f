//! Protobuf schema of the bitswap wire format (`/ipfs/bitswap/1.2.0`).
#![allow(clippy::all)]

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(message, optional, tag = "1")]
    pub wantlist: ::core::option::Option<message::Wantlist>,
    /// Legacy (1.0.0) blocks, always CIDv0.
    #[prost(bytes = "bytes", repeated, tag = "2")]
    pub blocks: ::prost::alloc::vec::Vec<::bytes::Bytes>,
    #[prost(message, repeated, tag = "3")]
    pub payload: ::prost::alloc::vec::Vec<message::Block>,
    #[prost(message, repeated, tag = "4")]
    pub block_presences: ::prost::alloc::vec::Vec<message::BlockPresence>,
    #[prost(int32, tag = "5")]
    pub pending_bytes: i32,
}

pub mod message {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Wantlist {
        #[prost(message, repeated, tag = "1")]
        pub entries: ::prost::alloc::vec::Vec<wantlist::Entry>,
        #[prost(bool, tag = "2")]
        pub full: bool,
    }

    pub mod wantlist {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Entry {
            #[prost(bytes = "vec", tag = "1")]
            pub block: ::prost::alloc::vec::Vec<u8>,
            #[prost(int32, tag = "2")]
            pub priority: i32,
            #[prost(bool, tag = "3")]
            pub cancel: bool,
            #[prost(enumeration = "WantType", tag = "4")]
            pub want_type: i32,
            #[prost(bool, tag = "5")]
            pub send_dont_have: bool,
        }

        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum WantType {
            Block = 0,
            Have = 1,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Block {
        #[prost(bytes = "vec", tag = "1")]
        pub prefix: ::prost::alloc::vec::Vec<u8>,
        #[prost(bytes = "bytes", tag = "2")]
        pub data: ::bytes::Bytes,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BlockPresence {
        #[prost(bytes = "vec", tag = "1")]
        pub cid: ::prost::alloc::vec::Vec<u8>,
        #[prost(enumeration = "BlockPresenceType", tag = "2")]
        pub r#type: i32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum BlockPresenceType {
        Have = 0,
        DontHave = 1,
    }
}
