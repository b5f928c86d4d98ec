use gantry_api::api::Api;
use gantry_api::ir;
use gantry_api::route::KIND_HTTP_ROUTE;
use gantry_api::Resources;

use super::route::ir_route_prefix;
use super::{Translator, XdsIrMap};

impl Translator {
    /// Attach API policies to the IR routes generated from each API's routes.
    ///
    /// External authorization always comes from the API. CORS from an API is
    /// a default: a route that configures its own CORS policy keeps it.
    pub(super) fn process_apis(&self, resources: &Resources, xds_ir: &mut XdsIrMap) {
        for api in resources.unique_apis() {
            if api.spec.ext_auth.is_none() && api.spec.cors.is_none() {
                continue;
            }

            let prefixes: Vec<String> = api
                .spec
                .route_refs
                .iter()
                .map(|name| ir_route_prefix(KIND_HTTP_ROUTE, &api.metadata.namespace, name))
                .collect();

            let ext_auth = api.spec.ext_auth.as_ref().map(|e| ir::ExtAuth {
                name: api.metadata.namespaced_name().to_string(),
                host: e.host.clone(),
                port: e.port,
                timeout: e.timeout,
                fail_open: e.fail_open,
                headers_to_forward: e.headers_to_forward.clone(),
            });

            let mut attached = 0;
            let routes = xds_ir
                .values_mut()
                .flat_map(|xds| xds.http.iter_mut())
                .flat_map(|listener| listener.routes.iter_mut())
                .filter(|route| prefixes.iter().any(|p| route.name.starts_with(p)));

            for route in routes {
                attach(api, ext_auth.as_ref(), route);
                attached += 1;
            }

            tracing::debug!(
                api = %api.metadata.namespaced_name(),
                routes = attached,
                "attached api policies",
            );
        }
    }
}

fn attach(api: &Api, ext_auth: Option<&ir::ExtAuth>, route: &mut ir::HttpRoute) {
    if let Some(ext_auth) = ext_auth {
        route.ext_auth = Some(ext_auth.clone());
    }
    if route.cors.is_none() {
        route.cors = api.spec.cors.clone();
    }
}
