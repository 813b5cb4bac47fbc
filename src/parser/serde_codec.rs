//! JSON, MessagePack and bincode bodies through serde.

use super::{
    DecodeFn, EncodeFn, Factory, MsgCodec, ParseErrorPolicy, Parsed, ParserType, Registry, Route,
};
use crate::core::message::Message;
use crate::core::serialization::SerializationFormat;
use crate::error::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Body type usable with the serde parsers. Use `()` for "no reply body".
pub trait SerdeBody: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

impl<T> SerdeBody for T where T: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

pub(crate) fn factory<T: SerdeBody>() -> Option<Factory> {
    if TypeId::of::<T>() == TypeId::of::<()>() {
        return None;
    }
    Some(Arc::new(|| Box::new(T::default()) as Box<dyn Any + Send + Sync>))
}

pub(crate) fn encoder<T: SerdeBody>(format: SerializationFormat) -> EncodeFn {
    Arc::new(move |value: &dyn Any| match value.downcast_ref::<T>() {
        Some(v) => format.encode(v),
        None => Err(ProtocolError::ProtoPack("body type mismatch".into())),
    })
}

pub(crate) fn route<C: SerdeBody, S: SerdeBody>(
    format: SerializationFormat,
    encoders: &mut HashMap<TypeId, EncodeFn>,
) -> Route {
    let c2s_encode = encoder::<C>(format);
    encoders.insert(TypeId::of::<C>(), c2s_encode.clone());
    if factory::<S>().is_some() {
        encoders.insert(TypeId::of::<S>(), encoder::<S>(format));
    }

    let decode: DecodeFn = Arc::new(move |data: &[u8]| {
        format
            .decode::<C>(data)
            .map(|v| Box::new(v) as Box<dyn Any + Send + Sync>)
    });

    Route {
        decode,
        c2s_new: Arc::new(|| Box::new(C::default()) as Box<dyn Any + Send + Sync>),
        c2s_encode: Some(c2s_encode),
        s2c_new: factory::<S>(),
    }
}

/// Table driven codec over one serde format
pub struct SerdeCodec {
    kind: ParserType,
    format: SerializationFormat,
    policy: ParseErrorPolicy,
    registry: Registry,
}

impl SerdeCodec {
    pub(crate) fn new(
        kind: ParserType,
        format: SerializationFormat,
        policy: ParseErrorPolicy,
        registry: Registry,
    ) -> Self {
        Self {
            kind,
            format,
            policy,
            registry,
        }
    }
}

impl MsgCodec for SerdeCodec {
    fn kind(&self) -> ParserType {
        self.kind
    }

    fn error_policy(&self) -> ParseErrorPolicy {
        self.policy
    }

    fn parse_c2s(&self, msg: &Message) -> Result<Parsed> {
        let format = self.format;
        self.registry
            .parse_with(msg, |detail| format.unpack_error(detail))
    }

    fn pack(&self, value: &dyn Any) -> Result<Vec<u8>> {
        match self.registry.pack(value) {
            Some(result) => result,
            None => Err(match self.format {
                SerializationFormat::Json => ProtocolError::JsonPack("unregistered type".into()),
                SerializationFormat::MessagePack => {
                    ProtocolError::MsgPackPack("unregistered type".into())
                }
                SerializationFormat::Bincode => {
                    ProtocolError::ProtoPack("unregistered type".into())
                }
            }),
        }
    }
}
