//! Management path routing
//!
//! Table-driven dispatch over the registered path patterns. Literal
//! routes are tried before the `bus/{bus}/{dev}` stream-activation shape,
//! so `bus/5/add` is a management operation while `bus/5/1` promotes the
//! connection to a device stream.

use protocol::{PathPattern, Problem};
use std::sync::LazyLock;

/// A resolved management route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Ping,
    BusList,
    BusCreate,
    BusRemove,
    DeviceList { bus: u32 },
    DeviceAdd { bus: u32 },
    DeviceRemove { bus: u32 },
    StreamActivate { bus: u32, dev: u32 },
}

enum RouteKind {
    Ping,
    BusList,
    BusCreate,
    BusRemove,
    DeviceList,
    DeviceAdd,
    DeviceRemove,
    StreamActivate,
}

static ROUTES: LazyLock<Vec<(PathPattern, RouteKind)>> = LazyLock::new(|| {
    vec![
        (PathPattern::new("ping"), RouteKind::Ping),
        (PathPattern::new("bus/list"), RouteKind::BusList),
        (PathPattern::new("bus/create"), RouteKind::BusCreate),
        (PathPattern::new("bus/remove"), RouteKind::BusRemove),
        (PathPattern::new("bus/{id}/list"), RouteKind::DeviceList),
        (PathPattern::new("bus/{id}/add"), RouteKind::DeviceAdd),
        (PathPattern::new("bus/{id}/remove"), RouteKind::DeviceRemove),
        (PathPattern::new("bus/{bus}/{dev}"), RouteKind::StreamActivate),
    ]
});

fn parse_u32(value: &str, what: &str) -> Result<u32, Problem> {
    value
        .parse()
        .map_err(|_| Problem::bad_request(format!("invalid {what}: '{value}'")))
}

/// Resolve a request path to a route.
pub fn route(path: &str) -> Result<Route, Problem> {
    for (pattern, kind) in ROUTES.iter() {
        let Some(params) = pattern.matches(path) else {
            continue;
        };
        let resolved = match kind {
            RouteKind::Ping => Route::Ping,
            RouteKind::BusList => Route::BusList,
            RouteKind::BusCreate => Route::BusCreate,
            RouteKind::BusRemove => Route::BusRemove,
            RouteKind::DeviceList => Route::DeviceList {
                bus: parse_u32(params.get("id").expect("pattern has id"), "bus id")?,
            },
            RouteKind::DeviceAdd => Route::DeviceAdd {
                bus: parse_u32(params.get("id").expect("pattern has id"), "bus id")?,
            },
            RouteKind::DeviceRemove => Route::DeviceRemove {
                bus: parse_u32(params.get("id").expect("pattern has id"), "bus id")?,
            },
            RouteKind::StreamActivate => {
                let bus = params.get("bus").expect("pattern has bus");
                let dev = params.get("dev").expect("pattern has dev");
                // Non-numeric segments mean this was not a stream
                // activation after all; keep looking (there is nothing
                // after this route, so report the path as unknown).
                match (bus.parse(), dev.parse()) {
                    (Ok(bus), Ok(dev)) => Route::StreamActivate { bus, dev },
                    _ => continue,
                }
            }
        };
        return Ok(resolved);
    }
    Err(Problem::not_found(format!("unrecognized path: '{path}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_routes() {
        assert_eq!(route("ping").unwrap(), Route::Ping);
        assert_eq!(route("bus/list").unwrap(), Route::BusList);
        assert_eq!(route("bus/create").unwrap(), Route::BusCreate);
        assert_eq!(route("bus/remove").unwrap(), Route::BusRemove);
    }

    #[test]
    fn test_device_routes_extract_bus_id() {
        assert_eq!(route("bus/80000/list").unwrap(), Route::DeviceList { bus: 80000 });
        assert_eq!(route("bus/1/add").unwrap(), Route::DeviceAdd { bus: 1 });
        assert_eq!(route("bus/7/remove").unwrap(), Route::DeviceRemove { bus: 7 });
    }

    #[test]
    fn test_stream_activation_needs_numeric_segments() {
        assert_eq!(
            route("bus/80000/1").unwrap(),
            Route::StreamActivate { bus: 80000, dev: 1 }
        );
        // Literal routes win over the stream shape.
        assert_eq!(route("bus/80000/add").unwrap(), Route::DeviceAdd { bus: 80000 });
        // Non-numeric device segment is not a stream activation.
        assert_eq!(route("bus/80000/abc").unwrap_err().status, 404);
    }

    #[test]
    fn test_bad_bus_id_is_400() {
        assert_eq!(route("bus/abc/list").unwrap_err().status, 400);
        assert_eq!(route("bus/99999999999/add").unwrap_err().status, 400);
    }

    #[test]
    fn test_unknown_path_is_404() {
        assert_eq!(route("nope").unwrap_err().status, 404);
        assert_eq!(route("bus").unwrap_err().status, 404);
        assert_eq!(route("bus/1/2/3").unwrap_err().status, 404);
    }
}
