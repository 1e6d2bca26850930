//! Service registration and method lookup.
//!
//! Handlers are registered explicitly through [`ServiceBuilder`]. Each typed
//! method is wrapped once into a [`MethodHandler`] that decodes the request,
//! runs the call hooks and the handler, and encodes the reply, so dispatch
//! deals with a single shape.

use crate::context::Context;
use crate::error::{DispatchError, RegistryError, ServiceError};

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::Arc;
use tether_protocol::SerializeType;

/// Future returned by a [`MethodHandler`].
pub type MethodFuture = BoxFuture<'static, Result<Bytes, DispatchError>>;

/// Uniform adapter every registered method is erased into.
pub type MethodHandler = Arc<dyn Fn(Context, SerializeType, Bytes) -> MethodFuture + Send + Sync>;

/// Describes a registered method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Method name.
    pub name: String,
    /// Type name of the request argument.
    pub request_type: &'static str,
    /// Type name of the reply.
    pub response_type: &'static str,
    /// Whether the method takes raw bytes under any serializer.
    pub raw: bool,
}

struct Method {
    descriptor: MethodDescriptor,
    handler: MethodHandler,
}

/// Collects the methods of one service before registration.
pub struct ServiceBuilder {
    name: String,
    methods: Vec<Method>,
}

impl ServiceBuilder {
    /// Start a service named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Add a typed method.
    ///
    /// The request is decoded and the reply encoded with the serializer the
    /// caller named in the header.
    #[must_use]
    pub fn method<Req, Resp, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, ServiceError>> + Send + 'static,
    {
        self.methods.push(typed_method(name.into(), handler));
        self
    }

    /// Add a method working on raw payload bytes.
    #[must_use]
    pub fn raw_method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, ServiceError>> + Send + 'static,
    {
        self.methods.push(raw_method(name.into(), handler));
        self
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("name", &self.name)
            .field(
                "methods",
                &self
                    .methods
                    .iter()
                    .map(|method| method.descriptor.name.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn typed_method<Req, Resp, F, Fut>(name: String, handler: F) -> Method
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, ServiceError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let adapter: MethodHandler = Arc::new(move |ctx: Context, serialize: SerializeType, payload: Bytes| {
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            if !serialize.is_typed() {
                return Err(DispatchError::UnsupportedSerializer(serialize as u8));
            }
            let request: Req = serialize
                .decode(&payload)
                .map_err(|e| DispatchError::Decode(e.to_string()))?;

            ctx.plugins()
                .pre_call(&ctx)
                .await
                .map_err(DispatchError::Hook)?;
            let reply = handler(ctx.clone(), request)
                .await
                .map_err(|e| DispatchError::Handler(e.to_string()))?;
            ctx.plugins()
                .post_call(&ctx)
                .await
                .map_err(DispatchError::Hook)?;

            serialize
                .encode(&reply)
                .map_err(|e| DispatchError::Encode(e.to_string()))
        }) as MethodFuture
    });

    Method {
        descriptor: MethodDescriptor {
            name,
            request_type: std::any::type_name::<Req>(),
            response_type: std::any::type_name::<Resp>(),
            raw: false,
        },
        handler: adapter,
    }
}

fn raw_method<F, Fut>(name: String, handler: F) -> Method
where
    F: Fn(Context, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, ServiceError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let adapter: MethodHandler = Arc::new(move |ctx: Context, _serialize: SerializeType, payload: Bytes| {
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            ctx.plugins()
                .pre_call(&ctx)
                .await
                .map_err(DispatchError::Hook)?;
            let reply = handler(ctx.clone(), payload)
                .await
                .map_err(|e| DispatchError::Handler(e.to_string()))?;
            ctx.plugins()
                .post_call(&ctx)
                .await
                .map_err(DispatchError::Hook)?;
            Ok(reply)
        }) as MethodFuture
    });

    Method {
        descriptor: MethodDescriptor {
            name,
            request_type: std::any::type_name::<Bytes>(),
            response_type: std::any::type_name::<Bytes>(),
            raw: true,
        },
        handler: adapter,
    }
}

#[derive(Default)]
struct Service {
    methods: HashMap<String, Method>,
    functions: HashMap<String, Method>,
}

/// Services by name.
///
/// Registering a service name again replaces the whole entry, functions
/// attached with [`Registry::register_function`] included.
#[derive(Default)]
pub struct Registry {
    services: RwLock<HashMap<String, Service>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every method of a service.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::EmptyName`] for an empty service or method
    /// name, [`RegistryError::NoMethods`] if the builder holds no methods, and
    /// [`RegistryError::DuplicateMethod`] if a name repeats.
    pub fn register(
        &self,
        service: ServiceBuilder,
    ) -> Result<Vec<MethodDescriptor>, RegistryError> {
        let ServiceBuilder { name, methods } = service;
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if methods.is_empty() {
            return Err(RegistryError::NoMethods(name));
        }

        let mut by_name = HashMap::with_capacity(methods.len());
        let mut descriptors = Vec::with_capacity(methods.len());
        for method in methods {
            if method.descriptor.name.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            descriptors.push(method.descriptor.clone());
            match by_name.entry(method.descriptor.name.clone()) {
                Entry::Occupied(_) => {
                    return Err(RegistryError::DuplicateMethod {
                        service: name,
                        method: method.descriptor.name,
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(method);
                }
            }
        }

        self.services.write().insert(
            name,
            Service {
                methods: by_name,
                functions: HashMap::new(),
            },
        );
        Ok(descriptors)
    }

    /// Attach a single typed function to `service`, creating the service
    /// entry if needed. A function with the same name is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::EmptyName`] if either name is empty.
    pub fn register_function<Req, Resp, F, Fut>(
        &self,
        service: impl Into<String>,
        name: impl Into<String>,
        function: F,
    ) -> Result<MethodDescriptor, RegistryError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, ServiceError>> + Send + 'static,
    {
        let service = service.into();
        let name = name.into();
        if service.is_empty() || name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let method = typed_method(name.clone(), function);
        let descriptor = method.descriptor.clone();
        self.services
            .write()
            .entry(service)
            .or_default()
            .functions
            .insert(name, method);
        Ok(descriptor)
    }

    /// Find the handler for `service.method`. Methods shadow functions.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ServiceNotFound`] or
    /// [`DispatchError::MethodNotFound`].
    pub fn lookup(&self, service: &str, method: &str) -> Result<MethodHandler, DispatchError> {
        let services = self.services.read();
        let entry = services
            .get(service)
            .ok_or_else(|| DispatchError::ServiceNotFound(service.to_string()))?;

        entry
            .methods
            .get(method)
            .or_else(|| entry.functions.get(method))
            .map(|found| Arc::clone(&found.handler))
            .ok_or_else(|| DispatchError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            })
    }

    /// Names of all registered services, sorted.
    #[must_use]
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptors of a service's methods and functions, sorted by name.
    #[must_use]
    pub fn methods(&self, service: &str) -> Vec<MethodDescriptor> {
        let services = self.services.read();
        let Some(entry) = services.get(service) else {
            return Vec::new();
        };
        let mut descriptors: Vec<_> = entry
            .methods
            .values()
            .chain(entry.functions.values())
            .map(|method| method.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Remove a service with its functions. Returns whether it existed.
    pub fn unregister(&self, service: &str) -> bool {
        self.services.write().remove(service).is_some()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("services", &self.services())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use serde::Deserialize;
    use tether_protocol::Metadata;

    #[derive(Debug, Serialize, Deserialize)]
    struct Args {
        a: i64,
        b: i64,
    }

    fn arith() -> ServiceBuilder {
        ServiceBuilder::new("Arith")
            .method("Mul", |_ctx: Context, args: Args| async move {
                Ok::<_, ServiceError>(args.a * args.b)
            })
            .method("Div", |_ctx: Context, args: Args| async move {
                if args.b == 0 {
                    return Err(ServiceError::new("divide by zero"));
                }
                Ok(args.a / args.b)
            })
    }

    async fn invoke(
        registry: &Registry,
        method: &str,
        serialize: SerializeType,
        payload: Bytes,
    ) -> Result<Bytes, DispatchError> {
        let handler = registry.lookup("Arith", method)?;
        handler(test_context("Arith", method, Metadata::new()), serialize, payload).await
    }

    #[tokio::test]
    async fn test_typed_method_roundtrip() {
        let registry = Registry::new();
        let descriptors = registry.register(arith()).unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].request_type, std::any::type_name::<Args>());
        assert_eq!(descriptors[0].response_type, "i64");

        for serialize in [SerializeType::Json, SerializeType::Cbor] {
            let payload = serialize.encode(&Args { a: 7, b: 8 }).unwrap();
            let reply = invoke(&registry, "Mul", serialize, payload).await.unwrap();
            assert_eq!(serialize.decode::<i64>(&reply).unwrap(), 56);
        }
    }

    #[tokio::test]
    async fn test_dispatch_errors() {
        let registry = Registry::new();
        registry.register(arith()).unwrap();

        let payload = SerializeType::Json.encode(&Args { a: 1, b: 0 }).unwrap();
        let err = invoke(&registry, "Div", SerializeType::Json, payload.clone())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "divide by zero");

        let err = invoke(&registry, "Div", SerializeType::MsgPack, payload)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnsupportedSerializer(3)));

        let err = invoke(&registry, "Div", SerializeType::Json, Bytes::from_static(b"[1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Decode(_)));

        assert!(matches!(
            registry.lookup("Nope", "Mul"),
            Err(DispatchError::ServiceNotFound(_))
        ));
        assert!(matches!(
            registry.lookup("Arith", "Add"),
            Err(DispatchError::MethodNotFound { .. })
        ));
    }

    #[test]
    fn test_registration_errors() {
        let registry = Registry::new();
        assert_eq!(
            registry.register(ServiceBuilder::new("")).unwrap_err(),
            RegistryError::EmptyName
        );
        assert_eq!(
            registry.register(ServiceBuilder::new("Empty")).unwrap_err(),
            RegistryError::NoMethods("Empty".into())
        );

        let twice = arith().method("Mul", |_ctx: Context, args: Args| async move {
            Ok::<_, ServiceError>(args.a)
        });
        assert_eq!(
            registry.register(twice).unwrap_err(),
            RegistryError::DuplicateMethod {
                service: "Arith".into(),
                method: "Mul".into(),
            }
        );
        assert!(registry.services().is_empty());
    }

    #[tokio::test]
    async fn test_reregistration_replaces_whole_service() {
        let registry = Registry::new();
        registry.register(arith()).unwrap();
        registry
            .register_function("Arith", "Neg", |_ctx: Context, a: i64| async move {
                Ok::<_, ServiceError>(-a)
            })
            .unwrap();

        registry
            .register(ServiceBuilder::new("Arith").raw_method(
                "Echo",
                |_ctx: Context, payload: Bytes| async move { Ok(payload) },
            ))
            .unwrap();

        assert!(registry.lookup("Arith", "Mul").is_err());
        assert!(matches!(
            registry.lookup("Arith", "Neg"),
            Err(DispatchError::MethodNotFound { .. })
        ));
        let names: Vec<_> = registry
            .methods("Arith")
            .into_iter()
            .map(|method| method.name)
            .collect();
        assert_eq!(names, vec!["Echo"]);

        let reply = invoke(&registry, "Echo", SerializeType::Raw, Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"hi");
    }

    #[test]
    fn test_function_needs_names() {
        let registry = Registry::new();
        let result = registry.register_function("", "Neg", |_ctx: Context, a: i64| async move {
            Ok::<_, ServiceError>(-a)
        });
        assert_eq!(result.unwrap_err(), RegistryError::EmptyName);
    }
}
