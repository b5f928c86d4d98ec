use std::cmp::Reverse;

use gantry_api::ir::{self, PathMatch};

/// The precedence of a route. Routes with a higher precedence are evaluated
/// first. Routes are compared field by field:
///
/// - path match kind: exact, then regex, then prefix, then no path match
/// - the length of the path match string
/// - the number of header matches
/// - the number of query param matches
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Precedence {
    path_kind: u8,
    path_len: usize,
    headers: usize,
    query_params: usize,
}

impl Precedence {
    fn of(route: &ir::HttpRoute) -> Self {
        let (path_kind, path_len) = match &route.path_match {
            Some(m @ PathMatch::Exact(_)) => (3, m.value().len()),
            Some(m @ PathMatch::RegularExpression(_)) => (2, m.value().len()),
            Some(m @ PathMatch::Prefix(_)) => (1, m.value().len()),
            None => (0, 0),
        };

        Self {
            path_kind,
            path_len,
            headers: route.header_matches.len(),
            query_params: route.query_param_matches.len(),
        }
    }
}

/// Sort routes so that a proxy evaluating them in order picks the most
/// specific match.
///
/// The sort is stable: routes with the same precedence keep their input
/// order.
pub(crate) fn sort_routes(routes: &mut [ir::HttpRoute]) {
    routes.sort_by_cached_key(|r| Reverse(Precedence::of(r)));
}

#[cfg(test)]
mod test {
    use super::*;
    use gantry_api::ir::{NamedMatch, StringMatch};
    use std::str::FromStr;

    fn route(name: &str, path_match: Option<PathMatch>) -> ir::HttpRoute {
        let mut route = ir::HttpRoute::new(name, "*");
        route.path_match = path_match;
        route
    }

    fn names(routes: &[ir::HttpRoute]) -> Vec<&str> {
        routes.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_path_kind_beats_length() {
        let mut routes = vec![
            route("prefix", Some(PathMatch::Prefix("/a/very/long/prefix".to_string()))),
            route("none", None),
            route(
                "regex",
                Some(PathMatch::RegularExpression(ir_regex("/a/.*"))),
            ),
            route("exact", Some(PathMatch::Exact("/a".to_string()))),
        ];

        sort_routes(&mut routes);
        assert_eq!(names(&routes), vec!["exact", "regex", "prefix", "none"]);
    }

    #[test]
    fn test_tiebreakers() {
        let header = |name: &str| NamedMatch {
            name: name.to_string(),
            value: StringMatch::Exact("v".to_string()),
        };

        let mut short = route("short", Some(PathMatch::Prefix("/".to_string())));
        short.header_matches = vec![header("a"), header("b"), header("c")];

        let long = route("long", Some(PathMatch::Prefix("/foo".to_string())));

        let mut one_header = route("one-header", Some(PathMatch::Prefix("/bar".to_string())));
        one_header.header_matches = vec![header("a")];

        let mut query = one_header.clone();
        query.name = "query".to_string();
        query.query_param_matches = vec![header("q")];

        let mut routes = vec![short, long, one_header, query];
        sort_routes(&mut routes);
        assert_eq!(names(&routes), vec!["query", "one-header", "long", "short"]);
    }

    #[test]
    fn test_stable() {
        let mut routes: Vec<_> = (0..10)
            .map(|i| route(&format!("r{i}"), Some(PathMatch::Prefix("/".to_string()))))
            .collect();
        let before: Vec<_> = names(&routes).into_iter().map(String::from).collect();

        sort_routes(&mut routes);
        assert_eq!(names(&routes), before);
    }

    // every permutation of one route of each kind sorts the same way
    #[test]
    fn test_ordering_law() {
        let kinds = [
            route("exact", Some(PathMatch::Exact("/x".to_string()))),
            route("regex", Some(PathMatch::RegularExpression(ir_regex("/x.*")))),
            route("prefix", Some(PathMatch::Prefix("/x".to_string()))),
        ];

        for perm in [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]] {
            let mut routes: Vec<_> = perm.iter().map(|&i| kinds[i].clone()).collect();
            sort_routes(&mut routes);
            assert_eq!(names(&routes), vec!["exact", "regex", "prefix"]);
        }
    }

    fn ir_regex(s: &str) -> gantry_api::shared::Regex {
        gantry_api::shared::Regex::from_str(s).unwrap()
    }
}
