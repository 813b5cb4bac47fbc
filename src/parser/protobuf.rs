//! Protocol buffer bodies through `prost`.

use super::{
    DecodeFn, EncodeFn, Factory, MsgCodec, ParseErrorPolicy, Parsed, ParserType, Registry, Route,
};
use crate::core::message::Message;
use crate::error::{ProtocolError, Result};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Body type usable with the protobuf parser. `()` means "no reply body".
pub trait PbBody: prost::Message + Default + Send + Sync + 'static {}

impl<T> PbBody for T where T: prost::Message + Default + Send + Sync + 'static {}

fn encoder<T: PbBody>() -> EncodeFn {
    Arc::new(|value: &dyn Any| match value.downcast_ref::<T>() {
        Some(v) => Ok(v.encode_to_vec()),
        None => Err(ProtocolError::PbPack("body type mismatch".into())),
    })
}

fn factory<T: PbBody>() -> Option<Factory> {
    if TypeId::of::<T>() == TypeId::of::<()>() {
        return None;
    }
    Some(Arc::new(|| Box::new(T::default()) as Box<dyn Any + Send + Sync>))
}

pub(crate) fn route<C: PbBody, S: PbBody>(encoders: &mut HashMap<TypeId, EncodeFn>) -> Route {
    let c2s_encode = encoder::<C>();
    encoders.insert(TypeId::of::<C>(), c2s_encode.clone());
    if factory::<S>().is_some() {
        encoders.insert(TypeId::of::<S>(), encoder::<S>());
    }

    let decode: DecodeFn = Arc::new(|data: &[u8]| {
        C::decode(data)
            .map(|v| Box::new(v) as Box<dyn Any + Send + Sync>)
            .map_err(|e| ProtocolError::PbUnpack(e.to_string()))
    });

    Route {
        decode,
        c2s_new: Arc::new(|| Box::new(C::default()) as Box<dyn Any + Send + Sync>),
        c2s_encode: Some(c2s_encode),
        s2c_new: factory::<S>(),
    }
}

pub struct ProtobufCodec {
    policy: ParseErrorPolicy,
    registry: Registry,
}

impl ProtobufCodec {
    pub(crate) fn new(policy: ParseErrorPolicy, registry: Registry) -> Self {
        Self { policy, registry }
    }
}

impl MsgCodec for ProtobufCodec {
    fn kind(&self) -> ParserType {
        ParserType::Pb
    }

    fn error_policy(&self) -> ParseErrorPolicy {
        self.policy
    }

    fn parse_c2s(&self, msg: &Message) -> Result<Parsed> {
        self.registry.parse_with(msg, ProtocolError::PbUnpack)
    }

    fn pack(&self, value: &dyn Any) -> Result<Vec<u8>> {
        self.registry
            .pack(value)
            .unwrap_or_else(|| Err(ProtocolError::PbPack("unregistered type".into())))
    }
}
