use leakcheck::CheckEngine;
use leakcheck::cfg::{Cfg, CfgBuilder, MethodRef, Rvalue, Terminator, ThrowEdge};
use leakcheck::config::Options;
use leakcheck::create_default_engine;
use leakcheck::diagnostics::Diagnostic;
use leakcheck::hir::{ClassDecl, FieldDecl, MethodDecl, ParamDecl, Program};

fn check(program: &Program) -> Vec<Diagnostic> {
    create_default_engine()
        .check_program(program)
        .expect("checking should succeed")
}

fn closeable() -> ClassDecl {
    ClassDecl::new("Closeable")
        .must_call(["close"])
        .method(MethodDecl::new("close"))
}

fn leaks(diags: &[Diagnostic]) -> Vec<&Diagnostic> {
    diags
        .iter()
        .filter(|d| d.check.key == "required.method.not.called")
        .collect()
}

/// `void f(@Owning Closeable r) { try { transfer(r); } catch (IOException e) {} }`
///
/// Passing `r` to an owning parameter transfers ownership only if `transfer`
/// returns normally; the catch arm discards the exception without closing.
fn transfer_and_ignore(close_in_catch: bool) -> Program {
    let mut b = CfgBuilder::new();
    let entry = b.add_block();
    let after = b.add_block();
    let catch = b.add_block();
    b.terminate(
        entry,
        Terminator::Call {
            callee: MethodRef::new("Sink", "transfer"),
            receiver: None,
            args: vec!["r".into()],
            dest: None,
            normal: after,
            exceptional: vec![ThrowEdge {
                exception: "IOException".into(),
                target: catch,
            }],
        },
    );
    b.terminate(after, Terminator::Return { value: None });
    if close_in_catch {
        let done = b.add_block();
        b.terminate(
            catch,
            Terminator::Call {
                callee: MethodRef::new("Closeable", "close"),
                receiver: Some("r".into()),
                args: vec![],
                dest: None,
                normal: done,
                exceptional: vec![],
            },
        );
        b.terminate(done, Terminator::Return { value: None });
    } else {
        b.terminate(catch, Terminator::Return { value: None });
    }
    let cfg = b.finish();

    Program::new([
        closeable(),
        ClassDecl::new("Sink").method(
            MethodDecl::new("transfer").param(ParamDecl::new("resource", "Closeable").owning()),
        ),
        ClassDecl::new("Client").method(
            MethodDecl::new("f")
                .param(ParamDecl::new("r", "Closeable").owning())
                .with_body(cfg),
        ),
    ])
}

#[test]
fn transfer_on_exception_retains_caller_ownership() {
    let diags = check(&transfer_and_ignore(false));
    let leaks = leaks(&diags);
    assert_eq!(leaks.len(), 1);
    assert_eq!(leaks[0].element, "Client#f");
    assert!(leaks[0].message.contains("close"));
}

#[test]
fn transfer_with_cleanup_in_catch_is_accepted() {
    assert!(leaks(&check(&transfer_and_ignore(true))).is_empty());
}

/// `void g() { Closeable r = alloc(); if (cond) throw new NullPointerException(); r.close(); }`
///
/// The ignored-exception list excuses callee faults, not explicit throws:
/// the leak at the throw site is reported under the default configuration.
#[test]
fn explicit_throw_of_ignored_exception_still_leaks() {
    let mut b = CfgBuilder::new();
    let entry = b.add_block();
    let throwing = b.add_block();
    let closing = b.add_block();
    b.assign(
        entry,
        "r",
        Rvalue::Alloc {
            ty: "Closeable".into(),
        },
    );
    b.terminate(
        entry,
        Terminator::Branch {
            then_target: throwing,
            else_target: closing,
        },
    );
    let exceptional_exit = b.exceptional_exit();
    b.terminate(
        throwing,
        Terminator::Throw {
            exception: "NullPointerException".into(),
            target: exceptional_exit,
        },
    );
    let done = b.add_block();
    b.terminate(
        closing,
        Terminator::Call {
            callee: MethodRef::new("Closeable", "close"),
            receiver: Some("r".into()),
            args: vec![],
            dest: None,
            normal: done,
            exceptional: vec![],
        },
    );
    b.terminate(done, Terminator::Return { value: None });
    let program = Program::new([
        closeable(),
        ClassDecl::new("Client").method(MethodDecl::new("g").with_body(b.finish())),
    ]);

    let diags = check(&program);
    assert_eq!(leaks(&diags).len(), 1);
}

/// A callee that can only fail with an ignored runtime fault does not
/// contribute an exceptional edge; emptying the ignored list brings the
/// edge back.
#[test]
fn ignored_callee_fault_edges_are_excused() {
    let build = || -> Program {
        let mut b = CfgBuilder::new();
        let entry = b.add_block();
        let after = b.add_block();
        let done = b.add_block();
        let exceptional_exit = b.exceptional_exit();
        b.assign(
            entry,
            "r",
            Rvalue::Alloc {
                ty: "Closeable".into(),
            },
        );
        b.terminate(
            entry,
            Terminator::Call {
                callee: MethodRef::new("Helper", "poke"),
                receiver: None,
                args: vec![],
                dest: None,
                normal: after,
                exceptional: vec![ThrowEdge {
                    exception: "NullPointerException".into(),
                    target: exceptional_exit,
                }],
            },
        );
        b.terminate(
            after,
            Terminator::Call {
                callee: MethodRef::new("Closeable", "close"),
                receiver: Some("r".into()),
                args: vec![],
                dest: None,
                normal: done,
                exceptional: vec![],
            },
        );
        b.terminate(done, Terminator::Return { value: None });
        Program::new([
            closeable(),
            ClassDecl::new("Helper").method(MethodDecl::new("poke")),
            ClassDecl::new("Client").method(MethodDecl::new("g").with_body(b.finish())),
        ])
    };

    assert!(leaks(&check(&build())).is_empty());

    let mut strict = Options::default();
    strict.ignored_exceptions.clear();
    let diags = CheckEngine::with_options(strict)
        .check_program(&build())
        .expect("checking should succeed");
    assert_eq!(leaks(&diags).len(), 1);
}

/// Bodies for the owning-field-store scenarios: assign the owning field,
/// maybe throw, maybe clean up in a catch and rethrow. Used both for
/// constructors (where the store leaks on the exceptional path) and for
/// ordinary methods (where it never does).
fn field_store_body(cleanup_in_catch: bool) -> Cfg {
    let mut b = CfgBuilder::new();
    let entry = b.add_block();
    let throwing = b.add_block();
    let returning = b.add_block();
    let exceptional_exit = b.exceptional_exit();
    b.assign(
        entry,
        "this.resource",
        Rvalue::Alloc {
            ty: "Closeable".into(),
        },
    );
    b.terminate(
        entry,
        Terminator::Branch {
            then_target: throwing,
            else_target: returning,
        },
    );
    b.terminate(returning, Terminator::Return { value: None });
    if cleanup_in_catch {
        let catch = b.add_block();
        let rethrow = b.add_block();
        b.terminate(
            throwing,
            Terminator::Throw {
                exception: "IOException".into(),
                target: catch,
            },
        );
        b.terminate(
            catch,
            Terminator::Call {
                callee: MethodRef::new("Closeable", "close"),
                receiver: Some("this.resource".into()),
                args: vec![],
                dest: None,
                normal: rethrow,
                exceptional: vec![],
            },
        );
        b.terminate(
            rethrow,
            Terminator::Throw {
                exception: "IOException".into(),
                target: exceptional_exit,
            },
        );
    } else {
        b.terminate(
            throwing,
            Terminator::Throw {
                exception: "IOException".into(),
                target: exceptional_exit,
            },
        );
    }
    b.finish()
}

fn holder_with_constructor(body: Cfg) -> Program {
    Program::new([
        closeable(),
        ClassDecl::new("Holder")
            .must_call(["close"])
            .field(FieldDecl::new("resource", "Closeable").owning())
            .method(
                MethodDecl::new("close")
                    .ensures_called_methods(["this.resource"], ["close"])
                    .ensures_called_methods_on_exception(["this.resource"], ["close"]),
            )
            .method(MethodDecl::constructor().with_body(body)),
    ])
}

#[test]
fn constructor_partial_initialization_leaks_on_throw() {
    let diags = check(&holder_with_constructor(field_store_body(false)));
    let leaks = leaks(&diags);
    assert_eq!(leaks.len(), 1);
    assert_eq!(leaks[0].element, "Holder#<init>");
}

#[test]
fn constructor_cleanup_before_rethrow_is_accepted() {
    let diags = check(&holder_with_constructor(field_store_body(true)));
    assert!(leaks(&diags).is_empty());
}

/// The same store-then-throw body that leaks in a constructor is fine in an
/// ordinary method: the receiver is still reachable to the caller when the
/// method exits by exception, so storing into the owning field transfers
/// ownership on both exit kinds.
#[test]
fn non_constructor_field_store_does_not_leak_on_throw() {
    let program = Program::new([
        closeable(),
        ClassDecl::new("Holder")
            .must_call(["close"])
            .field(FieldDecl::new("resource", "Closeable").owning())
            .method(
                MethodDecl::new("close")
                    .ensures_called_methods(["this.resource"], ["close"])
                    .ensures_called_methods_on_exception(["this.resource"], ["close"]),
            )
            .method(
                MethodDecl::new("realloc")
                    .requires_called_methods(["this.resource"], ["close"])
                    .creates_must_call_for(None)
                    .with_body(field_store_body(false)),
            ),
    ]);
    let diags = check(&program);
    assert!(leaks(&diags).is_empty());
}

/// A normally-returning constructor hands its owning-field obligations to
/// the enclosing type; only the exceptional path is the constructor's own
/// problem.
#[test]
fn constructor_normal_return_does_not_leak_stored_fields() {
    let mut b = CfgBuilder::new();
    let entry = b.add_block();
    b.assign(
        entry,
        "this.resource",
        Rvalue::Alloc {
            ty: "Closeable".into(),
        },
    );
    b.terminate(entry, Terminator::Return { value: None });
    let diags = check(&holder_with_constructor(b.finish()));
    assert!(leaks(&diags).is_empty());
}

fn pool_classes() -> Vec<ClassDecl> {
    vec![
        closeable(),
        ClassDecl::new("Pool")
            .must_call(["close"])
            .field(FieldDecl::new("resource", "Closeable").owning())
            .method(
                MethodDecl::new("close")
                    .ensures_called_methods(["this.resource"], ["close"])
                    .ensures_called_methods_on_exception(["this.resource"], ["close"]),
            )
            .method(
                MethodDecl::new("realloc")
                    .requires_called_methods(["this.resource"], ["close"])
                    .creates_must_call_for(None),
            ),
    ]
}

/// The creates-must-call protocol: `realloc` requires the old obligation to
/// be discharged and reinstates a fresh one the caller must discharge again.
fn pool_client(close_after_realloc: bool) -> Program {
    let mut b = CfgBuilder::new();
    let entry = b.add_block();
    let after_close = b.add_block();
    let after_realloc = b.add_block();
    b.assign(entry, "x", Rvalue::Alloc { ty: "Pool".into() });
    b.terminate(
        entry,
        Terminator::Call {
            callee: MethodRef::new("Pool", "close"),
            receiver: Some("x".into()),
            args: vec![],
            dest: None,
            normal: after_close,
            exceptional: vec![],
        },
    );
    b.terminate(
        after_close,
        Terminator::Call {
            callee: MethodRef::new("Pool", "realloc"),
            receiver: Some("x".into()),
            args: vec![],
            dest: None,
            normal: after_realloc,
            exceptional: vec![],
        },
    );
    if close_after_realloc {
        let done = b.add_block();
        b.terminate(
            after_realloc,
            Terminator::Call {
                callee: MethodRef::new("Pool", "close"),
                receiver: Some("x".into()),
                args: vec![],
                dest: None,
                normal: done,
                exceptional: vec![],
            },
        );
        b.terminate(done, Terminator::Return { value: None });
    } else {
        b.terminate(after_realloc, Terminator::Return { value: None });
    }
    let cfg = b.finish();

    Program::new(
        pool_classes()
            .into_iter()
            .chain([ClassDecl::new("Client").method(MethodDecl::new("refresh").with_body(cfg))]),
    )
}

#[test]
fn creates_must_call_reinstated_obligation_discharged_is_accepted() {
    assert!(leaks(&check(&pool_client(true))).is_empty());
}

#[test]
fn creates_must_call_forgotten_second_close_leaks() {
    let diags = check(&pool_client(false));
    let leaks = leaks(&diags);
    assert_eq!(leaks.len(), 1);
    assert_eq!(leaks[0].element, "Client#refresh");
}

#[test]
fn creates_must_call_without_prior_discharge_is_reported() {
    // x = alloc; x.realloc() with the first close forgotten entirely.
    let mut b = CfgBuilder::new();
    let entry = b.add_block();
    let after_realloc = b.add_block();
    let done = b.add_block();
    b.assign(entry, "x", Rvalue::Alloc { ty: "Pool".into() });
    b.terminate(
        entry,
        Terminator::Call {
            callee: MethodRef::new("Pool", "realloc"),
            receiver: Some("x".into()),
            args: vec![],
            dest: None,
            normal: after_realloc,
            exceptional: vec![],
        },
    );
    b.terminate(
        after_realloc,
        Terminator::Call {
            callee: MethodRef::new("Pool", "close"),
            receiver: Some("x".into()),
            args: vec![],
            dest: None,
            normal: done,
            exceptional: vec![],
        },
    );
    b.terminate(done, Terminator::Return { value: None });
    let cfg = b.finish();

    let program = Program::new(
        pool_classes()
            .into_iter()
            .chain([ClassDecl::new("Client").method(MethodDecl::new("refresh").with_body(cfg))]),
    );

    let diags = check(&program);
    // The unproven precondition and the undischarged reinstatement both
    // anchor at the realloc call.
    assert!(!leaks(&diags).is_empty());
}

/// Allocation of a type with an empty must-call set needs no tracking.
#[test]
fn empty_must_call_set_is_trivially_accepted() {
    let mut b = CfgBuilder::new();
    let entry = b.add_block();
    b.assign(entry, "x", Rvalue::Alloc { ty: "Plain".into() });
    b.terminate(entry, Terminator::Return { value: None });
    let program = Program::new([
        ClassDecl::new("Plain"),
        ClassDecl::new("Client").method(MethodDecl::new("make").with_body(b.finish())),
    ]);
    assert!(check(&program).is_empty());
}

/// Returning an owned value hands the obligation to the caller.
#[test]
fn owning_return_transfers_obligation_to_caller() {
    let mut b = CfgBuilder::new();
    let entry = b.add_block();
    b.assign(
        entry,
        "r",
        Rvalue::Alloc {
            ty: "Closeable".into(),
        },
    );
    b.terminate(
        entry,
        Terminator::Return {
            value: Some("r".into()),
        },
    );
    let program = Program::new([
        closeable(),
        ClassDecl::new("Factory").method(
            MethodDecl::new("open")
                .returns("Closeable")
                .with_body(b.finish()),
        ),
    ]);
    assert!(leaks(&check(&program)).is_empty());
}

/// Overwriting the last reference to an undischarged resource leaks at the
/// assignment point.
#[test]
fn overwriting_last_reference_leaks_at_assignment() {
    let mut b = CfgBuilder::new();
    let entry = b.add_block();
    let done = b.add_block();
    b.assign(
        entry,
        "r",
        Rvalue::Alloc {
            ty: "Closeable".into(),
        },
    );
    b.assign(
        entry,
        "r",
        Rvalue::Alloc {
            ty: "Closeable".into(),
        },
    );
    b.terminate(
        entry,
        Terminator::Call {
            callee: MethodRef::new("Closeable", "close"),
            receiver: Some("r".into()),
            args: vec![],
            dest: None,
            normal: done,
            exceptional: vec![],
        },
    );
    b.terminate(done, Terminator::Return { value: None });
    let program = Program::new([
        closeable(),
        ClassDecl::new("Client").method(MethodDecl::new("churn").with_body(b.finish())),
    ]);
    let diags = check(&program);
    let leaks = leaks(&diags);
    assert_eq!(leaks.len(), 1);
    assert!(leaks[0].message.contains("overwritten"));
}

/// Aliasing: discharging through one member of the alias set discharges
/// the obligation for all of them.
#[test]
fn discharge_through_alias_is_accepted() {
    let mut b = CfgBuilder::new();
    let entry = b.add_block();
    let done = b.add_block();
    b.assign(
        entry,
        "r",
        Rvalue::Alloc {
            ty: "Closeable".into(),
        },
    );
    b.assign(entry, "s", Rvalue::Use("r".into()));
    b.terminate(
        entry,
        Terminator::Call {
            callee: MethodRef::new("Closeable", "close"),
            receiver: Some("s".into()),
            args: vec![],
            dest: None,
            normal: done,
            exceptional: vec![],
        },
    );
    b.terminate(done, Terminator::Return { value: None });
    let program = Program::new([
        closeable(),
        ClassDecl::new("Client").method(MethodDecl::new("shuffle").with_body(b.finish())),
    ]);
    assert!(leaks(&check(&program)).is_empty());
}

/// Swapping branch arms must not change the reported leak set.
#[test]
fn reported_leaks_are_independent_of_successor_order() {
    let build = |throw_on_then: bool| -> Program {
        let mut b = CfgBuilder::new();
        let entry = b.add_block();
        let throwing = b.add_block();
        let closing = b.add_block();
        let done = b.add_block();
        let exceptional_exit = b.exceptional_exit();
        b.assign(
            entry,
            "r",
            Rvalue::Alloc {
                ty: "Closeable".into(),
            },
        );
        let (then_target, else_target) = if throw_on_then {
            (throwing, closing)
        } else {
            (closing, throwing)
        };
        b.terminate(
            entry,
            Terminator::Branch {
                then_target,
                else_target,
            },
        );
        b.terminate(
            throwing,
            Terminator::Throw {
                exception: "IOException".into(),
                target: exceptional_exit,
            },
        );
        b.terminate(
            closing,
            Terminator::Call {
                callee: MethodRef::new("Closeable", "close"),
                receiver: Some("r".into()),
                args: vec![],
                dest: None,
                normal: done,
                exceptional: vec![],
            },
        );
        b.terminate(done, Terminator::Return { value: None });
        Program::new([
            closeable(),
            ClassDecl::new("Client").method(MethodDecl::new("g").with_body(b.finish())),
        ])
    };

    let first: Vec<_> = check(&build(true))
        .into_iter()
        .map(|d| (d.check.key, d.point, d.message))
        .collect();
    let second: Vec<_> = check(&build(false))
        .into_iter()
        .map(|d| (d.check.key, d.point, d.message))
        .collect();
    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
}

/// A malformed body surfaces as an internal diagnostic and does not stop
/// sibling methods from being analyzed.
#[test]
fn internal_failure_is_transactional_per_method() {
    use leakcheck::cfg::BlockId;

    let mut broken = CfgBuilder::new();
    let entry = broken.add_block();
    broken.terminate(entry, Terminator::Goto(BlockId(42)));

    let mut leaky = CfgBuilder::new();
    let entry = leaky.add_block();
    let exceptional_exit = leaky.exceptional_exit();
    leaky.assign(
        entry,
        "r",
        Rvalue::Alloc {
            ty: "Closeable".into(),
        },
    );
    leaky.terminate(
        entry,
        Terminator::Throw {
            exception: "IOException".into(),
            target: exceptional_exit,
        },
    );

    let program = Program::new([
        closeable(),
        ClassDecl::new("Client")
            .method(MethodDecl::new("broken").with_body(broken.finish()))
            .method(MethodDecl::new("leaky").with_body(leaky.finish())),
    ]);

    let diags = check(&program);
    assert!(diags.iter().any(|d| d.check.key == "type.system.error"));
    assert!(
        diags
            .iter()
            .any(|d| d.check.key == "required.method.not.called" && d.element == "Client#leaky")
    );
}
