
use std::{cell::Cell, rc::Rc, time::Duration};

use blox::{
    BloxError, BloxInterface, Context, EMBEDDED_CONTENTS, Engine, EngineOptions, Eventually,
    FragmentResolver, Function, MapResolver, Renderable, Tree, Value,
};
use fixtures::{
    block_on, delayed, generate_random_whitespace, generate_random_whitespace_at_least_one,
    get_engine, render_now, slow_identity,
};
use pretty_assertions::assert_eq;

#[test]
#[ntest::timeout(100)]
fn test_plain_text_is_unchanged() {
    for text in [
        "",
        "Hello, world!",
        "a [single] bracket, ]] and a lone [ at the end [",
        "multi\nline\n\ttext\n",
    ] {
        assert_eq!(render_now(text, &Context::new()), text);
    }
}

#[test]
#[ntest::timeout(100)]
fn test_end_to_end() {
    let context = Context::new().with("name", "Fred");
    assert_eq!(render_now("Hello, [[name]]!", &context), "Hello, Fred!");
}

#[test]
#[ntest::timeout(100)]
fn test_precedence_and_associativity() {
    let context = Context::new();
    assert_eq!(render_now("[[2 + 3 * 4]]", &context), "14");
    assert_eq!(render_now("[[10 - 3 - 2]]", &context), "5");
    assert_eq!(render_now("[[(2 + 3) * 4]]", &context), "20");
    assert_eq!(render_now("[[1 + 2 < 4 && 3 == 3]]", &context), "true");
    assert_eq!(render_now("[[!0 || 5]]", &context), "true");
}

#[test]
#[ntest::timeout(100)]
fn test_whitespace_between_tokens() {
    let template = format!(
        "[[{}a{}+{}b{}]]|[[+each(items){}->{}x{}]][[x]][[-each]]",
        generate_random_whitespace(),
        generate_random_whitespace(),
        generate_random_whitespace(),
        generate_random_whitespace(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace(),
    );

    let context = Context::new()
        .with("a", 1)
        .with("b", 2)
        .with("items", vec!["x", "y"]);
    assert_eq!(render_now(&template, &context), "3|xy", "rendering {:?}", template);
}

#[test]
#[ntest::timeout(100)]
fn test_unbalanced_blocks() {
    let mut engine = get_engine();
    let error = engine
        .add_template("page", "[[+one]][[+two]][[-one]]")
        .unwrap_err();
    let BloxError::Parse(error) = error else {
        panic!("Expected a parse error, got {:?}", error);
    };
    assert_eq!(error.message, "Expected [[-two]]");
    assert_eq!(error.line(), 1);
    assert_eq!(error.column(), "[[+one]][[+two]][[-".len() + 1);
}

#[test]
#[ntest::timeout(100)]
fn test_error_positions_track_lines() {
    let error = blox::parse_source("line one\nline [[two]]\n  [[1 +]]", "lines.blx").unwrap_err();
    assert_eq!(error.source_name(), "lines.blx");
    assert_eq!(error.line(), 3);
    assert!(error.column() > 3, "column {} should be inside the block", error.column());
}

#[test]
#[ntest::timeout(100)]
fn test_scope_shadowing() {
    let context = Context::new().with("items", vec![9]);
    assert_eq!(
        render_now("[[x=1]][[+each(items)->x]][[x]][[-each]][[x]]", &context),
        "91"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_escaping_is_single_pass() {
    let context = Context::new().with("v", "<b>\"Q&A\"</b>");
    assert_eq!(
        render_now("[[v!]]", &context),
        "&lt;b&gt;&quot;Q&amp;A&quot;&lt;/b&gt;"
    );
    assert_eq!(render_now("[[v]]", &context), "<b>\"Q&A\"</b>");
    assert_eq!(
        render_now("[[escape(\"<i>\")]]", &context),
        "&lt;i&gt;"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_missing_data_is_empty() {
    let context = Context::new().with("user", Value::object([("name", "Ann")]));
    assert_eq!(render_now("[[a.b.c]]", &Context::new()), "");
    assert_eq!(render_now("[[user.address.city]]", &context), "");
    assert_eq!(render_now("[[user[\"name\"]]]:[[nothing[0]]]", &context), "Ann:");
    assert_eq!(render_now("[[nothing?]]|[[null]]", &context), "|");
}

#[test]
#[ntest::timeout(100)]
fn test_pipe() {
    let context = Context::new().with(
        "double",
        Function::new(|args| Value::from(args.first().map_or(0.0, Value::to_number) * 2.0)),
    );
    assert_eq!(render_now("[[5 | double]]", &context), "10");
    assert_eq!(render_now("[[5 | double | double]]", &context), "20");
}

#[test]
#[ntest::timeout(1000)]
fn test_async_order_is_preserved() {
    let context = Context::new()
        .with("first", delayed(30, "1"))
        .with("second", delayed(5, "2"))
        .with("third", "3");

    let output = blox::render("[[first]]-[[second]]-[[third]]", &context);
    assert!(!output.is_ready(), "Render should wait on deferred values");
    assert_eq!(block_on(output).unwrap(), "1-2-3");
}

#[test]
#[ntest::timeout(1000)]
fn test_async_functions_and_helpers() {
    let context = Context::new()
        .with("slow", slow_identity(10))
        .with("items", vec!["a", "b"]);

    let output = blox::render(
        "[[slow(\"x\")]] [[+if(slow(true))]]yes[[-if]] [[+each(slow(items)) -> v]][[v]][[-each]]",
        &context,
    );
    assert_eq!(block_on(output).unwrap(), "x yes ab");
}

#[test]
#[ntest::timeout(1000)]
fn test_deferred_assignment_is_awaited_when_read() {
    let context = Context::new().with("later", delayed(10, 4));
    let output = blox::render("[[x = later + 1]]<[[x]]>", &context);
    assert_eq!(block_on(output).unwrap(), "<5>");
}

#[test]
#[ntest::timeout(100)]
fn test_close_through_application() {
    let context = Context::new().with("items", vec![1, 2]);
    assert_eq!(
        render_now("[[+each(items) -> x]][[x]][[-each(other)]]", &context),
        "12"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_close_through_pipe() {
    let context = Context::new().with("items", vec![1, 2]);
    assert_eq!(
        render_now("[[+items | each -> x]]<[[x]]>[[-items]]", &context),
        "<1><2>"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_implicit_block() {
    assert_eq!(
        render_now(
            "[[=page]]<main>[[embeddedContents]]</main>[[-page]][[*page]]body",
            &Context::new()
        ),
        "<main>body</main>"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_comments() {
    assert_eq!(
        render_now("a[[# note ]] still a comment #]]b", &Context::new()),
        "ab"
    );

    let error = blox::parse("a[[# never closed").unwrap_err();
    assert_eq!(error.line(), 1);
}

#[test]
#[ntest::timeout(100)]
fn test_if_helper() {
    let template = "[[+if(n > 1)]][[:then]]many[[-then]][[:else]]one[[-else]][[-if]]";
    assert_eq!(render_now(template, &Context::new().with("n", 2)), "many");
    assert_eq!(render_now(template, &Context::new().with("n", 1)), "one");

    let template = "[[+if(ok)]]yes[[else: \"no\"]][[-if]]";
    assert_eq!(render_now(template, &Context::new().with("ok", true)), "yes");
    assert_eq!(render_now(template, &Context::new().with("ok", false)), "no");
    assert_eq!(render_now("[[+if(ok)]]yes[[-if]]", &Context::new()), "");
}

#[test]
#[ntest::timeout(100)]
fn test_each_helper() {
    let context = Context::new()
        .with("items", vec!["a", "b"])
        .with("user", Value::object([("name", Value::from("Ann")), ("age", Value::from(3))]));

    assert_eq!(
        render_now("[[+each(items) -> item, i]][[i]]:[[item]] [[-each]]", &context),
        "0:a 1:b "
    );
    assert_eq!(
        render_now("[[+each(user) -> v, k]][[k]]=[[v]];[[-each]]", &context),
        "age=3;name=Ann;"
    );
    assert_eq!(render_now("[[+each(missing)]]x[[-each]]", &context), "");
}

#[test]
#[ntest::timeout(100)]
fn test_let_helper() {
    let context = Context::new();
    assert_eq!(
        render_now("[[+let(1 + 1, \"x\") -> a, b]][[a]][[b]][[-let]]", &context),
        "2x"
    );
    assert_eq!(
        render_now("[[+with(\"Bo\") -> name]]Hi [[name]]![[-with]]", &context),
        "Hi Bo!"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_assignments() {
    let context = Context::new()
        .with("user", Value::object([("name", "Ann")]))
        .with("list", vec![1, 2, 3]);

    assert_eq!(
        render_now("[[x = 1]][[x += 2]][[x *= 3]][[x]]", &context),
        "9"
    );
    assert_eq!(
        render_now("[[s = \"a\"]][[s += \"b\"]][[s]]", &context),
        "ab"
    );
    assert_eq!(
        render_now("[[user.name = \"Bo\"]][[user.name]]", &context),
        "Bo"
    );
    assert_eq!(render_now("[[user.name]]", &context), "Ann");
    assert_eq!(render_now("[[list[1] = 5]][[list]]", &context), "1,5,3");
}

#[test]
#[ntest::timeout(100)]
fn test_templates_as_values() {
    let template = concat!(
        "[[=greet -> who]]Hello, [[who]]![[-greet]]",
        "[[greet(\"Ann\")]] [[greet{who: \"Bo\"}]] ",
        "[[+greet]][[who: \"Cy\"]][[-greet]]",
    );
    assert_eq!(
        render_now(template, &Context::new()),
        "Hello, Ann! Hello, Bo! Hello, Cy!"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_static_and_instance_definitions() {
    let mut engine = get_engine();
    let count = Rc::new(Cell::new(0));
    let counter = Rc::clone(&count);
    engine.define(
        "tick",
        Function::new(move |_| {
            counter.set(counter.get() + 1);
            Value::from(counter.get())
        }),
    );
    engine
        .add_template(
            "rows",
            concat!(
                "[[=item -> x]][[k = tick() s]][[n = tick() i]][[x]][[k]][[n]] [[-item]]",
                "[[+each(list) -> v]][[item(v)]][[-each]]",
            ),
        )
        .unwrap();

    let context = Context::new().with("list", vec!["a", "b"]);
    assert_eq!(engine.render_sync("rows", Some(&context)).unwrap(), "a12 b13 ");
    assert_eq!(count.get(), 3);
}

#[test]
#[ntest::timeout(100)]
fn test_block_contents_statics_run_once() {
    let mut engine = get_engine();
    let count = Rc::new(Cell::new(0));
    let counter = Rc::clone(&count);
    engine.define(
        "tick",
        Function::new(move |_| {
            counter.set(counter.get() + 1);
            Value::from(counter.get())
        }),
    );
    engine
        .add_template(
            "rows",
            "[[+each(list) -> v]][[k = tick() s]][[n = tick() i]][[v]][[k]][[n]] [[-each]]",
        )
        .unwrap();

    let context = Context::new().with("list", vec!["a", "b"]);
    assert_eq!(engine.render_sync("rows", Some(&context)).unwrap(), "a12 b13 ");
    assert_eq!(count.get(), 3);
}

#[test]
#[ntest::timeout(100)]
fn test_injections_are_visible_to_the_block_expression() {
    assert_eq!(
        render_now("[[+if(flag)]][[flag: true]]yes[[-if]]", &Context::new()),
        "yes"
    );

    let context = Context::new().with("flag", false).with("name", "Bo");
    assert_eq!(
        render_now(
            "[[+if(flag)]][[flag: name == \"Bo\"]]hi [[name]][[-if]]|[[flag]]",
            &context
        ),
        "hi Bo|false"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_deferred_values_inside_containers() {
    let context = Context::new()
        .with("items", Value::array([delayed(5, "a"), Value::from("b")]))
        .with(
            "nested",
            Value::array([
                delayed(20, "x"),
                Value::array([delayed(1, "<y>"), Value::from("z")]),
            ]),
        );

    let output = blox::render("[[items]] [[nested]] [[nested!]]", &context);
    assert!(!output.is_ready(), "Render should wait on nested deferred values");
    assert_eq!(
        block_on(output).unwrap(),
        "a,b x,<y>,z x,&lt;y&gt;,z"
    );

    let output = blox::render("[[+each([items]) -> row]][[row]][[-each]]", &context);
    assert_eq!(block_on(output).unwrap(), "a,b");
}

#[test]
#[ntest::timeout(100)]
fn test_non_callable_application() {
    let context = Context::new().with("name", "x");
    let error = blox::render("[[name()]]", &context)
        .now()
        .unwrap()
        .unwrap_err();
    assert_eq!(
        error.message,
        "Cannot apply `name`: string is not a function or template"
    );
    assert_eq!(error.location.map(|location| location.column), Some(3));
}

#[test]
#[ntest::timeout(100)]
fn test_include_and_import() {
    let resolver = MapResolver::new()
        .with("parts.footer", "(c) [[year]]")
        .with("card", "<div>[[embeddedContents]]</div>");
    let mut engine = Engine::new().with_resolver(resolver);
    engine
        .add_template("footer", "<footer>[[include(\"parts.footer\")]]</footer>")
        .unwrap();
    engine
        .add_template(
            "wrapped",
            "[[+include(\"parts.footer\") -> footer]]<b>[[footer]]</b>[[-include]]",
        )
        .unwrap();
    engine
        .add_template("cards", "[[card @= \"card\"]][[+card]]one[[-card]][[+card]]two[[-card]]")
        .unwrap();
    engine
        .add_template("block_import", "[[@=card]] card [[-card]][[+card]]three[[-card]]")
        .unwrap();
    engine
        .add_template("missing", "[[include(\"nope\")]]")
        .unwrap();

    let context = Context::new().with("year", 2024);
    assert_eq!(
        engine.render_sync("footer", Some(&context)).unwrap(),
        "<footer>(c) 2024</footer>"
    );
    assert_eq!(
        engine.render_sync("wrapped", Some(&context)).unwrap(),
        "<b>(c) 2024</b>"
    );
    assert_eq!(
        engine.render_sync("cards", None).unwrap(),
        "<div>one</div><div>two</div>"
    );
    assert_eq!(
        engine.render_sync("block_import", None).unwrap(),
        "<div>three</div>"
    );
    assert_eq!(
        engine.render_sync("missing", None).unwrap_err().to_string(),
        "Render error: Could not resolve fragment \"nope\""
    );
}

#[test]
#[ntest::timeout(100)]
fn test_fragments_need_a_resolver() {
    let mut engine = get_engine();
    engine.add_template("page", "[[include(\"nav\")]]").unwrap();
    assert_eq!(
        engine.render_sync("page", None),
        Err(BloxError::render("Could not resolve fragment \"nav\""))
    );
}

struct SlowResolver;

impl FragmentResolver for SlowResolver {
    fn resolve(&self, module_path: &str) -> Eventually<String> {
        let source = format!("<[[\"{}\"]]>", module_path);
        Eventually::defer(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(source)
        })
    }
}

#[test]
#[ntest::timeout(1000)]
fn test_deferred_fragments() {
    let mut engine = Engine::new().with_resolver(SlowResolver);
    engine
        .add_template("page", "a[[include(\"x\")]]b[[include(\"y\")]]c")
        .unwrap();

    let output = engine.render("page", None).unwrap();
    assert!(!output.is_ready(), "Fragments should load asynchronously");
    assert_eq!(block_on(output).unwrap(), "a<x>b<y>c");
    assert!(matches!(
        engine.render_sync("page", None),
        Err(BloxError::Render(_))
    ));
}

#[test]
#[ntest::timeout(100)]
fn test_host_block_helper() {
    let mut engine = get_engine();
    engine.define(
        "bold",
        Renderable::helper(Vec::<String>::new(), |env| match env.local(EMBEDDED_CONTENTS) {
            Value::Renderable(contents) => contents
                .render(env.render_context())
                .map(|tree| Tree::Leaf(format!("<b>{}</b>", tree.concat()))),
            _ => Eventually::ready(Tree::empty()),
        }),
    );
    engine.add_template("page", "[[+bold]]hi [[name]][[-bold]]").unwrap();

    let context = Context::new().with("name", "Bo");
    assert_eq!(engine.render_sync("page", Some(&context)).unwrap(), "<b>hi Bo</b>");
}

#[test]
#[ntest::timeout(100)]
fn test_engine_templates() {
    let mut engine = get_engine();
    engine.add_template("a", "A").unwrap();
    assert_eq!(
        engine.add_template("a", "again"),
        Err(BloxError::TemplateExists {
            template_name: "a".to_string()
        })
    );
    assert!(matches!(
        engine.render("b", None),
        Err(BloxError::MissingTemplate { .. })
    ));
    assert_eq!(engine.render_sync("a", None).unwrap(), "A");
    assert_eq!(
        engine.render_str("[[1 + 1]]", None).now(),
        Some(Ok("2".to_string()))
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_render_file_and_fragment_directory() {
    let directory = std::env::temp_dir().join(format!("blox-integration-{}", std::process::id()));
    std::fs::create_dir_all(directory.join("parts")).unwrap();
    std::fs::write(directory.join("parts").join("nav.blx"), "<nav>[[here]]</nav>").unwrap();
    std::fs::write(
        directory.join("page.blx"),
        "[[include(\"parts.nav\")]] Hello, [[name]]!",
    )
    .unwrap();

    let engine = Engine::with_options(EngineOptions {
        fragment_directory: Some(directory.clone()),
        ..EngineOptions::default()
    });
    let context = Context::new().with("name", "Fred").with("here", "home");
    let output = engine
        .render_file(directory.join("page.blx"), Some(&context))
        .unwrap();
    let output = block_on(output);

    let missing = engine.render_file(directory.join("missing.blx"), None);
    std::fs::remove_dir_all(&directory).unwrap();

    assert_eq!(output.unwrap(), "<nav>home</nav> Hello, Fred!");
    assert!(matches!(missing, Err(BloxError::Io { .. })));
}
