pub mod group;
pub mod outbound;
pub mod settings;
pub mod subscription;
pub mod target;

pub use group::{GroupDef, GroupKind};
pub use outbound::{
    OutboundDescriptor, ProtocolConfig, Provenance, TlsConfig, TlsKind, Transport,
};
pub use settings::{RoutePin, Settings};
pub use subscription::{SubscriptionFormat, SubscriptionSource};
pub use target::{CustomService, Device, DeviceMode, RoutingTarget, Service};
