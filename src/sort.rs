//! Fixed sorting networks for small arrays.
//!
//! Data-oblivious compare/swap sequences for 2 to 9 elements; the dispatch
//! loop instantiates the 6-wide network on its local batch. The predicate
//! returns true when its first argument should stay in front.

#[inline(always)]
fn compare_swap<T>(pred: &impl Fn(&T, &T) -> bool, arr: &mut [T], a: usize, b: usize) {
    if !pred(&arr[a], &arr[b]) {
        arr.swap(a, b);
    }
}

macro_rules! sorting_network {
    ($name:ident, $n:expr, [$(($a:expr, $b:expr)),* $(,)?]) => {
        pub fn $name<T>(pred: impl Fn(&T, &T) -> bool, arr: &mut [T; $n]) {
            $(compare_swap(&pred, arr, $a, $b);)*
        }
    };
}

sorting_network!(sort2, 2, [(0, 1)]);

sorting_network!(sort3, 3, [(0, 2), (0, 1), (1, 2)]);

sorting_network!(sort4, 4, [(0, 2), (1, 3), (0, 1), (2, 3), (1, 2)]);

sorting_network!(
    sort5,
    5,
    [
        (0, 3),
        (1, 4),
        (0, 2),
        (1, 3),
        (0, 1),
        (2, 4),
        (1, 2),
        (3, 4),
        (2, 3),
    ]
);

sorting_network!(
    sort6,
    6,
    [
        (0, 5),
        (1, 3),
        (2, 4),
        (1, 2),
        (3, 4),
        (0, 3),
        (2, 5),
        (0, 1),
        (2, 3),
        (4, 5),
        (1, 2),
        (3, 4),
    ]
);

sorting_network!(
    sort7,
    7,
    [
        (0, 6),
        (2, 3),
        (4, 5),
        (0, 2),
        (1, 4),
        (3, 6),
        (0, 1),
        (2, 5),
        (3, 4),
        (1, 2),
        (4, 6),
        (2, 3),
        (4, 5),
        (1, 2),
        (3, 4),
        (5, 6),
    ]
);

sorting_network!(
    sort8,
    8,
    [
        (0, 2),
        (1, 3),
        (4, 6),
        (5, 7),
        (0, 4),
        (1, 5),
        (2, 6),
        (3, 7),
        (0, 1),
        (2, 3),
        (4, 5),
        (6, 7),
        (2, 4),
        (3, 5),
        (1, 4),
        (3, 6),
        (1, 2),
        (3, 4),
        (5, 6),
    ]
);

sorting_network!(
    sort9,
    9,
    [
        (0, 3),
        (1, 7),
        (2, 5),
        (4, 8),
        (0, 7),
        (2, 4),
        (3, 8),
        (5, 6),
        (0, 2),
        (1, 3),
        (4, 5),
        (7, 8),
        (1, 4),
        (3, 6),
        (5, 7),
        (0, 1),
        (2, 4),
        (3, 5),
        (6, 8),
        (2, 3),
        (4, 5),
        (6, 7),
        (1, 2),
        (3, 4),
        (5, 6),
    ]
);
