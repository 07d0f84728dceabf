use super::*;

#[test]
fn test_parse_linear() {
    let tree = parse("y=x*2+1").unwrap();
    assert_eq!(tree.eval(&[64.0]), 129.0);
    assert_eq!(tree.eval(&[0.0]), 1.0);
}

#[test]
fn test_parse_without_prefix() {
    let tree = parse("(x - 10) / 2").unwrap();
    assert_eq!(tree.eval(&[30.0]), 10.0);
}

#[test]
fn test_parse_functions() {
    let tree = parse("y = max(abs(x), 2)").unwrap();
    assert_eq!(tree.eval(&[-5.0]), 5.0);
    assert_eq!(tree.eval(&[1.0]), 2.0);

    let tree = parse("pow(x, 2) % 7").unwrap();
    assert_eq!(tree.eval(&[4.0]), 2.0);
}

#[test]
fn test_convergent_inputs() {
    let tree = parse("y = x0 + x1 * 2").unwrap();
    assert_eq!(tree.eval(&[1.0, 3.0]), 7.0);
}

#[test]
fn test_unary_minus() {
    let tree = parse("y=-x+1").unwrap();
    assert_eq!(tree.eval(&[4.0]), -3.0);
}

#[test]
fn test_parse_errors() {
    assert_eq!(parse("y=("), Err(crate::Error::ErrExpressionSyntax));
    assert_eq!(parse(""), Err(crate::Error::ErrExpressionSyntax));
    assert_eq!(parse("y=x+"), Err(crate::Error::ErrExpressionSyntax));
    assert_eq!(parse("y=x)"), Err(crate::Error::ErrExpressionSyntax));
    assert_eq!(parse("y=foo(x)"), Err(crate::Error::ErrExpressionSyntax));
    assert_eq!(parse("y=x9"), Err(crate::Error::ErrExpressionSyntax));
    assert_eq!(parse("y=1..2"), Err(crate::Error::ErrExpressionSyntax));
}
