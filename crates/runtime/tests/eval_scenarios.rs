//! End-to-end evaluation scenarios over the full pipeline
//!
//! These run text through read → analyze → compile → VM (and a tree-walk
//! mirror for a few) and check the language contract: arithmetic reduce,
//! lazy streams, map equality and hashing, atoms under sequential
//! contention, and reader round trips.

use sable_runtime::{Backend, eval_str, set_backend};
use serial_test::serial;

fn eval_ok(src: &str) -> sable_core::value::Value {
    sable_runtime::init();
    set_backend(Backend::Vm);
    eval_str(src).unwrap_or_else(|e| panic!("eval of {:?} failed: {}", src, e))
}

fn eval_str_result(src: &str) -> String {
    sable_core::printer::pr_str(&eval_ok(src))
}

#[test]
#[serial]
fn test_arithmetic_reduce() {
    assert_eq!(eval_str_result("(reduce + 0 (range 1 101))"), "5050");
}

#[test]
#[serial]
fn test_lazy_infinite_stream_terminated_by_take() {
    assert_eq!(eval_str_result("(take 5 (iterate inc 0))"), "(0 1 2 3 4)");
}

#[test]
#[serial]
fn test_hash_map_equality_and_hashing() {
    assert_eq!(
        eval_str_result("(= {:a 1 :b 2} (into {} [[:b 2] [:a 1]]))"),
        "true"
    );
    assert_eq!(
        eval_str_result("(= (hash {:a 1 :b 2}) (hash (into {} [[:b 2] [:a 1]])))"),
        "true"
    );
}

#[test]
#[serial]
fn test_atom_swap_under_sequential_contention() {
    assert_eq!(
        eval_str_result("(let [a (atom 0)] (dotimes [_ 1000] (swap! a inc)) @a)"),
        "1000"
    );
}

#[test]
#[serial]
fn test_reader_round_trip_for_rich_form() {
    let out = eval_str_result(
        r##"(= (read-string (pr-str (read-string "#{1 :a \"x\" [1 2] {:k (1 2 3)}}")))
              #{1 :a "x" [1 2] {:k '(1 2 3)}})"##,
    );
    assert_eq!(out, "true");
}

#[test]
#[serial]
fn test_persistent_update_leaves_source_unchanged() {
    assert_eq!(
        eval_str_result("(let [v [1 2 3] v2 (conj v 4)] [(count v) (count v2) (nth v 2)])"),
        "[3 4 3]"
    );
    assert_eq!(
        eval_str_result("(let [m {:a 1} m2 (assoc m :b 2)] [(count m) (count m2) (:a m)])"),
        "[1 2 1]"
    );
}

#[test]
#[serial]
fn test_fn_definitions_closures_and_recursion() {
    assert_eq!(
        eval_str_result("(do (defn fact [n] (if (<= n 1) 1 (* n (fact (dec n))))) (fact 10))"),
        "3628800"
    );
    assert_eq!(
        eval_str_result("(let [add (fn [a] (fn [b] (+ a b)))] ((add 3) 4))"),
        "7"
    );
    // Variadic and multi-arity
    assert_eq!(
        eval_str_result("(do (defn arity-probe ([] 0) ([x] 1) ([x & xs] (+ 1 (count xs)))) [(arity-probe) (arity-probe 9) (arity-probe 1 2 3)])"),
        "[0 1 3]"
    );
}

#[test]
#[serial]
fn test_loop_recur_is_constant_space() {
    // A million iterations only completes if recur reuses the frame
    assert_eq!(
        eval_str_result("(loop [i 0 acc 0] (if (< i 1000000) (recur (inc i) (+ acc 1)) acc))"),
        "1000000"
    );
}

#[test]
#[serial]
fn test_apply_concat_composition() {
    assert_eq!(
        eval_str_result("(apply + (concat [1 2] [3 4]))"),
        "10"
    );
    assert_eq!(
        eval_str_result("(= (apply + (concat [1 2] [3])) (apply (fn [& xs] (apply + xs)) 1 [2 3]))"),
        "true"
    );
}

#[test]
#[serial]
fn test_keyword_map_set_as_functions() {
    assert_eq!(eval_str_result("(:a {:a 1})"), "1");
    assert_eq!(eval_str_result("(:missing {:a 1} :fallback)"), ":fallback");
    assert_eq!(eval_str_result("({:a 1} :a)"), "1");
    assert_eq!(eval_str_result("(#{1 2} 2)"), "2");
    assert_eq!(eval_str_result("(#{1 2} 9)"), "nil");
    assert_eq!(eval_str_result("([10 20] 1)"), "20");
}

#[test]
#[serial]
fn test_try_catch_finally_semantics() {
    assert_eq!(
        eval_str_result(
            "(let [log (atom [])]
               (try
                 (throw (ex-info \"boom\" {:code 7}))
                 (catch ExceptionInfo e (swap! log conj (:code (ex-data e))))
                 (finally (swap! log conj :cleanup)))
               @log)"
        ),
        "[7 :cleanup]"
    );
    // Finally runs when nothing is thrown
    assert_eq!(
        eval_str_result(
            "(let [log (atom [])] [(try 1 (finally (swap! log conj :fin))) @log])"
        ),
        "[1 [:fin]]"
    );
    // Uncaught class falls through to an outer handler
    assert_eq!(
        eval_str_result(
            "(try (try (throw (ex-info \"x\" {})) (catch ClassCastException e :wrong))
                  (catch ExceptionInfo e :right))"
        ),
        ":right"
    );
}

#[test]
#[serial]
fn test_case_dispatch() {
    assert_eq!(
        eval_str_result("(case 2 1 :one 2 :two :other)"),
        ":two"
    );
    assert_eq!(
        eval_str_result("(case 99 1 :one 2 :two :other)"),
        ":other"
    );
    assert_eq!(
        eval_str_result("(case :b (:a :b) :letter :other)"),
        ":letter"
    );
}

#[test]
#[serial]
fn test_destructuring() {
    assert_eq!(
        eval_str_result("(let [[a b & r :as all] [1 2 3 4]] [a b (count r) (count all)])"),
        "[1 2 2 4]"
    );
    assert_eq!(
        eval_str_result("(let [{:keys [x y] :or {y 9} :as m} {:x 1}] [x y (count m)])"),
        "[1 9 1]"
    );
    assert_eq!(
        eval_str_result("(do (defn middle-name [{:keys [middle]}] middle) (middle-name {:middle \"q\"}))"),
        "\"q\""
    );
}

#[test]
#[serial]
fn test_dynamic_binding() {
    assert_eq!(
        eval_str_result(
            "(do (def ^:dynamic *level* 0)
                 [(binding [*level* 5] *level*) *level*])"
        ),
        "[5 0]"
    );
    assert_eq!(
        eval_str_result(
            "(do (def ^:dynamic *slot* 0)
                 (binding [*slot* 1] (set! *slot* 42) *slot*))"
        ),
        "42"
    );
}

#[test]
#[serial]
fn test_protocols_and_reify() {
    assert_eq!(
        eval_str_result(
            "(do (defprotocol Describable (describe [this]))
                 (extend-type Integer Describable (describe [this] (str \"int:\" this)))
                 (extend-type Object Describable (describe [this] \"something\"))
                 [(describe 5) (describe \\x)])"
        ),
        "[\"int:5\" \"something\"]"
    );
    assert_eq!(
        eval_str_result(
            "(do (defprotocol Greets (greet [this]))
                 (let [v (reify Greets (greet [this] :hi))] (greet v)))"
        ),
        ":hi"
    );
}

#[test]
#[serial]
fn test_multimethods() {
    assert_eq!(
        eval_str_result(
            "(do (defmulti area :shape)
                 (defmethod area :circle [{:keys [r]}] (* 3 r r))
                 (defmethod area :default [_] 0)
                 [(area {:shape :circle :r 2}) (area {:shape :blob})])"
        ),
        "[12 0]"
    );
}

#[test]
#[serial]
fn test_tree_walk_backend_matches_vm() {
    sable_runtime::init();
    for src in [
        "(reduce + 0 (range 1 101))",
        "(take 5 (iterate inc 0))",
        "(let [[a & r] [1 2 3]] [a (count r)])",
        "(try (throw (ex-info \"e\" {:k 1})) (catch Exception e (:k (ex-data e))))",
    ] {
        set_backend(Backend::Vm);
        let vm_out = sable_core::printer::pr_str(&eval_str(src).unwrap());
        set_backend(Backend::TreeWalk);
        let tw_out = sable_core::printer::pr_str(&eval_str(src).unwrap());
        set_backend(Backend::Vm);
        assert_eq!(vm_out, tw_out, "backends diverge on {}", src);
    }
}

#[test]
#[serial]
fn test_volatiles_and_transients() {
    assert_eq!(
        eval_str_result("(let [v (volatile! 1)] (vswap! v + 5) @v)"),
        "6"
    );
    assert_eq!(
        eval_str_result("(persistent! (reduce conj! (transient []) (range 4)))"),
        "[0 1 2 3]"
    );
}

#[test]
#[serial]
fn test_lazy_seq_library() {
    assert_eq!(
        eval_str_result("(take 4 (map * (range) (range)))"),
        "(0 1 4 9)"
    );
    assert_eq!(
        eval_str_result("(doall (filter even? (range 10)))"),
        "(0 2 4 6 8)"
    );
    assert_eq!(eval_str_result("(take 3 (repeat :x))"), "(:x :x :x)");
    assert_eq!(
        eval_str_result("(for [x [1 2 3] :when (odd? x)] (* x 10))"),
        "(10 30)"
    );
    assert_eq!(
        eval_str_result("(frequencies [:a :b :a])"),
        "{:a 2, :b 1}"
    );
}

#[test]
#[serial]
fn test_reader_conditional_and_tagged_literals() {
    assert_eq!(eval_str_result("#?(:sbl :native :default :other)"), ":native");
    assert_eq!(
        eval_str_result("#uuid \"550e8400-e29b-41d4-a716-446655440000\""),
        "\"550e8400-e29b-41d4-a716-446655440000\""
    );
    sable_runtime::init();
    assert!(eval_str("#uuid \"not-a-uuid\"").is_err());
}

#[test]
#[serial]
fn test_error_surface() {
    sable_runtime::init();
    set_backend(Backend::Vm);
    let arity = eval_str("((fn [x] x))").unwrap_err();
    assert_eq!(arity.kind, sable_core::error::ErrorKind::Arity);
    let unbound = eval_str("(nonexistent-fn-xyz 1)").unwrap_err();
    assert_eq!(unbound.kind, sable_core::error::ErrorKind::Compile);
    let reader = eval_str("(unclosed").unwrap_err();
    assert_eq!(reader.kind, sable_core::error::ErrorKind::Reader);
    assert!(reader.pos.is_some());
}

#[test]
#[serial]
fn test_namespaces_and_require() {
    // Aliases must exist before the using form is analyzed, so require is
    // its own top-level form
    eval_ok("(require '[sable.string :as str])");
    assert_eq!(eval_str_result("(str/upper-case \"abc\")"), "\"ABC\"");
    // sable.walk is registered lazily and materialized on first require
    eval_ok("(require '[sable.walk :as walk])");
    assert_eq!(
        eval_str_result("(walk/postwalk (fn [x] (if (integer? x) (inc x) x)) {:a [1 2]})"),
        "{:a [2 3]}"
    );
    // in-ns takes effect for the following top-level forms
    eval_ok("(in-ns 'scratch.ns)");
    assert_eq!(eval_str_result("(do (def local-x 41) (inc local-x))"), "42");
    // Return to user for the remaining tests
    eval_ok("(in-ns 'user)");
}

#[test]
#[serial]
fn test_syntax_quote_macro_definition() {
    assert_eq!(
        eval_str_result(
            "(do (defmacro unless [test then else] `(if ~test ~else ~then))
                 (unless false :yes :no))"
        ),
        ":yes"
    );
    // Gensyms keep user macro bindings hygienic
    assert_eq!(
        eval_str_result(
            "(do (defmacro twice [form] `(let* [r# ~form] [r# r#]))
                 (twice (+ 1 2)))"
        ),
        "[3 3]"
    );
}

#[test]
#[serial]
fn test_interop_rewrites() {
    assert_eq!(eval_str_result("(Math/abs -4)"), "4");
    assert_eq!(eval_str_result("(. Math pow 2 10)"), "1024.0");
    sable_runtime::init();
    let err = eval_str("(Math/unknownMember 1)").unwrap_err();
    assert_eq!(err.kind, sable_core::error::ErrorKind::Value);
}

#[test]
#[serial]
fn test_promises() {
    assert_eq!(
        eval_str_result("(let [p (promise)] (deliver p 7) @p)"),
        "7"
    );
    assert_eq!(
        eval_str_result("(let [p (promise)] (deref p 10 :timeout))"),
        ":timeout"
    );
}

#[test]
#[serial]
fn test_equality_implies_hash_over_generated_values() {
    // Cross-representation seq equality and hash agreement
    assert_eq!(eval_str_result("(= [1 2 3] '(1 2 3))"), "true");
    assert_eq!(eval_str_result("(= (hash [1 2 3]) (hash '(1 2 3)))"), "true");
    assert_eq!(eval_str_result("(= (hash #{1 2}) (hash #{2 1}))"), "true");
    // Int and float are distinct partitions
    assert_eq!(eval_str_result("(= 1 1.0)"), "false");
    assert_eq!(eval_str_result("(== 1 1.0)"), "true");
}

#[test]
#[serial]
fn test_require_from_load_path() {
    sable_runtime::init();
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("acme")).unwrap();
    std::fs::write(
        dir.path().join("acme/util.sbl"),
        "(ns acme.util)\n(defn twice [x] (* 2 x))\n",
    )
    .unwrap();
    sable_runtime::env::global().push_load_path(dir.path().to_path_buf());
    eval_ok("(require 'acme.util)");
    assert_eq!(eval_str_result("(acme.util/twice 21)"), "42");
}

#[test]
#[serial]
fn test_gc_keeps_reachable_values() {
    assert_eq!(
        eval_str_result(
            "(do (def gc-kept (vec (range 100)))
                 (dotimes [_ 100] (vec (range 100)))
                 (gc)
                 (count gc-kept))"
        ),
        "100"
    );
}
