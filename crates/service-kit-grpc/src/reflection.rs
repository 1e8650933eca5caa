//! Server reflection.
//!
//! Lets introspection clients such as grpcurl discover the services a
//! server exposes without access to the `.proto` files. The health
//! service descriptors are always advertised; application services are
//! advertised from the descriptor sets registered on the server.

use tonic::service::RoutesBuilder;

/// Register the v1 and v1alpha reflection services on `routes`, advertising
/// the health service plus every set in `file_descriptor_sets`.
pub(crate) fn add_reflection_services(
    routes: &mut RoutesBuilder,
    file_descriptor_sets: &[&'static [u8]],
) -> Result<(), tonic_reflection::server::Error> {
    let configure = || {
        file_descriptor_sets.iter().fold(
            tonic_reflection::server::Builder::configure()
                .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET),
            |builder, set| builder.register_encoded_file_descriptor_set(set),
        )
    };

    routes.add_service(configure().build_v1()?);
    routes.add_service(configure().build_v1alpha()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_descriptors_are_always_registered() {
        let mut routes = RoutesBuilder::default();
        assert!(add_reflection_services(&mut routes, &[]).is_ok());
    }

    #[test]
    fn invalid_descriptor_set_is_rejected() {
        let mut routes = RoutesBuilder::default();
        let garbage: &'static [u8] = &[0xff, 0xff, 0xff];
        assert!(add_reflection_services(&mut routes, &[garbage]).is_err());
    }
}
